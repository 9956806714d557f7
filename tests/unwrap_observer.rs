//! Exercises a derived node built from other derived nodes (an "observer
//! of observers"), plus callback subscriptions and poll sources.

use propagate::{make_observer, wait_for_all_updates, Observer, PollSource, Source};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn derived_node_built_from_two_other_derived_nodes() {
    init();
    let a = Source::new(3);
    let b = Source::new(4);

    let a_obs = a.observer();
    let a_sq = make_observer(move || {
        let v = *a_obs.get_snapshot();
        v * v
    });

    let b_obs = b.observer();
    let b_sq = make_observer(move || *b_obs.get_snapshot() * *b_obs.get_snapshot());

    let a_sq_for_sum = a_sq.clone();
    let b_sq_for_sum = b_sq.clone();
    let pythagorean = make_observer(move || {
        *a_sq_for_sum.get_snapshot() + *b_sq_for_sum.get_snapshot()
    });

    assert_eq!(*pythagorean.get_snapshot(), 9 + 16);

    a.set(5);
    wait_for_all_updates();
    assert_eq!(*pythagorean.get_snapshot(), 25 + 16);
}

/// The "observer of observers" scenario this file is named for: a node
/// whose published *value* is itself an `Observer` handle, not a value
/// merely computed from one. Reading it out takes two unwraps -- one
/// `get_snapshot` to get at the handle, another to get at the handle's own
/// target -- and the handle can be swapped out for a different target at
/// runtime.
#[test]
fn derived_node_unwraps_a_value_that_is_itself_an_observer_handle() {
    init();
    let a = Source::new(1i64);
    let b = Source::new(100i64);
    let a_obs = a.observer();
    let b_obs = b.observer();

    // `indirection`'s value is an `Observer<i64>` handle, not an `i64`.
    let indirection: Source<Observer<i64>> = Source::new(a_obs);
    let indirection_obs = indirection.observer();

    let unwrapped = make_observer(move || {
        let target: Observer<i64> = (*indirection_obs.get_snapshot()).clone();
        *target.get_snapshot()
    });

    assert_eq!(*unwrapped.get_snapshot(), 1);

    a.set(2);
    wait_for_all_updates();
    assert_eq!(*unwrapped.get_snapshot(), 2);

    // Switch the indirection to point at `b` entirely, at runtime.
    indirection.set(b_obs);
    wait_for_all_updates();
    assert_eq!(*unwrapped.get_snapshot(), 100);

    b.set(200);
    wait_for_all_updates();
    assert_eq!(*unwrapped.get_snapshot(), 200);

    // `a` is no longer reachable through the indirection; changing it must
    // not affect `unwrapped` anymore.
    a.set(999);
    wait_for_all_updates();
    assert_eq!(*unwrapped.get_snapshot(), 200);
}

#[test]
fn callback_fires_once_immediately_and_again_on_every_publish() {
    init();
    let source = Source::new(1);
    let src_obs = source.observer();
    let doubled = make_observer(move || *src_obs.get_snapshot() * 2);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = seen.clone();
    let handle = doubled.add_callback(move |snap| recorder.lock().unwrap().push(*snap));

    assert_eq!(*seen.lock().unwrap(), vec![2]);

    source.set(2);
    wait_for_all_updates();
    source.set(3);
    wait_for_all_updates();

    assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6]);

    drop(handle);
    source.set(4);
    wait_for_all_updates();

    // No new entry after the handle was dropped.
    assert_eq!(*seen.lock().unwrap(), vec![2, 4, 6]);
}

#[test]
fn reassigning_a_callback_handle_cannot_leak_the_old_subscription() {
    init();
    let source = Source::new(1);
    let src_obs = source.observer();
    let doubled = make_observer(move || *src_obs.get_snapshot() * 2);

    let fire_count = Arc::new(AtomicUsize::new(0));
    let mut handle = {
        let count = fire_count.clone();
        doubled.add_callback(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };
    // Reassigning immediately drops the prior handle's subscription.
    handle = {
        let count = fire_count.clone();
        doubled.add_callback(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
        })
    };

    let before = fire_count.load(Ordering::SeqCst);
    source.set(9);
    wait_for_all_updates();
    let after = fire_count.load(Ordering::SeqCst);

    // Only the surviving callback should have fired for this update.
    assert_eq!(after - before, 1);
    drop(handle);
}

#[test]
fn poll_source_refreshes_on_external_notification() {
    init();
    let reading = Arc::new(AtomicI64::new(10));
    let notify_slot: Arc<Mutex<Option<Box<dyn Fn() + Send + Sync>>>> = Arc::new(Mutex::new(None));

    let reading_for_get = reading.clone();
    let notify_for_sub = notify_slot.clone();
    let notify_for_unsub = notify_slot.clone();
    let poll = PollSource::new(
        move || reading_for_get.load(Ordering::SeqCst),
        move |notify| {
            *notify_for_sub.lock().unwrap() = Some(notify);
        },
        move || {
            *notify_for_unsub.lock().unwrap() = None;
        },
    );

    let obs = poll.observer();
    assert_eq!(*obs.get_snapshot(), 10);

    reading.store(42, Ordering::SeqCst);
    notify_slot.lock().unwrap().as_ref().unwrap()();
    wait_for_all_updates();

    assert_eq!(*obs.get_snapshot(), 42);

    drop(poll);
}
