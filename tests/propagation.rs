use propagate::{make_observer, wait_for_all_updates, Source};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn simple_source_to_derived_propagation() {
    init();
    let source = Source::new(1);
    let src_obs = source.observer();
    let doubled = make_observer(move || *src_obs.get_snapshot() * 2);

    assert_eq!(*doubled.get_snapshot(), 2);

    source.set(5);
    wait_for_all_updates();

    assert_eq!(*doubled.get_snapshot(), 10);
}

#[test]
fn diamond_dependency_recomputes_once_per_update() {
    init();
    let source = Source::new(2);

    let left_src = source.observer();
    let left = make_observer(move || *left_src.get_snapshot() + 1);

    let right_src = source.observer();
    let right = make_observer(move || *right_src.get_snapshot() * 10);

    let left_for_sum = left.clone();
    let right_for_sum = right.clone();
    let sum = make_observer(move || *left_for_sum.get_snapshot() + *right_for_sum.get_snapshot());

    assert_eq!(*sum.get_snapshot(), 3 + 20);

    source.set(4);
    wait_for_all_updates();

    assert_eq!(*left.get_snapshot(), 5);
    assert_eq!(*right.get_snapshot(), 40);
    assert_eq!(*sum.get_snapshot(), 45);
}

#[test]
fn chained_derived_nodes_propagate_through_multiple_hops() {
    init();
    let source = Source::new(1);

    let s1 = source.observer();
    let plus_one = make_observer(move || *s1.get_snapshot() + 1);

    let s2 = plus_one.clone();
    let times_two = make_observer(move || *s2.get_snapshot() * 2);

    let s3 = times_two.clone();
    let minus_three = make_observer(move || *s3.get_snapshot() - 3);

    assert_eq!(*minus_three.get_snapshot(), (1 + 1) * 2 - 3);

    source.set(10);
    wait_for_all_updates();

    assert_eq!(*minus_three.get_snapshot(), (10 + 1) * 2 - 3);
}

#[test]
fn rapid_successive_sets_settle_on_the_final_value() {
    init();
    let source = Source::new(0);
    let src_obs = source.observer();
    let squared = make_observer(move || {
        let v = *src_obs.get_snapshot();
        v * v
    });

    for i in 1..=50 {
        source.set(i);
    }
    wait_for_all_updates();

    assert_eq!(*squared.get_snapshot(), 50 * 50);
}
