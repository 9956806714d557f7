//! The node: per-observer shared state, and the type-erased `AnyNode`
//! trait that lets heterogeneous `Node<T>`s reference each other as
//! dependencies and dependents.
//!
//! Structurally this generalizes the teacher's `Slot<Q, MP>` /
//! `QueryState<Q>` / `Memo<Q>` (`derived/slot.rs`) from a pull-based
//! memoization cell into a push-based publication cell: instead of
//! recomputing lazily on `read()` and caching the result, a `Node<T>` is
//! recomputed by the manager's worker pool whenever it is dirtied, and
//! immediately publishes a new `Snapshot<T>` that existing readers can see
//! without any locking beyond a short read-lock clone.

use crate::errors::EvalError;
use crate::recorder;
use crate::FxIndexMap;
use crossbeam_utils::atomic::AtomicCell;
use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use smallvec::SmallVec;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

/// A node's stable identity. Never reused within a process.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(u64);

impl NodeId {
    fn next() -> Self {
        static COUNTER: AtomicCell<u64> = AtomicCell::new(0);
        NodeId(COUNTER.fetch_add(1))
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Node#{}", self.0)
    }
}

/// Where a node sits in the manager's scheduling state machine.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum NodeState {
    /// Not queued, not evaluating. The published snapshot is up to date.
    Fresh,
    /// Queued on the manager's dirty queue, not yet picked up by a worker.
    Dirty,
    /// A worker is currently running this node's evaluator.
    Evaluating,
    /// The node's last evaluation attempt failed; it retains its prior
    /// snapshot and is not queued. A later dirty-trigger retries it.
    Failed,
}

/// Type-erased handle to a node, so that `Node<T>` and `Node<U>` can refer
/// to each other as dependencies/dependents despite differing in `T`.
/// Mirrors the role the teacher's `DatabaseKeyIndex` plays for dynamic
/// dispatch across query types, but as a real trait object rather than a
/// packed integer, since evaluation here needs virtual dispatch, not just
/// identity comparison.
pub(crate) trait AnyNode: Send + Sync {
    fn id(&self) -> NodeId;
    fn root_version(&self) -> u64;
    fn state(&self) -> NodeState;

    /// Transitions the node towards `Dirty`, coalescing with any
    /// in-flight evaluation. Returns `true` if this call is the one that
    /// should push the node onto the manager's queue (i.e. it was idle),
    /// `false` if it is already queued or will be re-run automatically
    /// when its current evaluation finishes.
    fn mark_dirty(self: Arc<Self>) -> bool;

    /// Runs one evaluation attempt. Returns `true` if the node was marked
    /// dirty again during this evaluation and should be re-run
    /// immediately (the "diamond efficiency" coalescing path), `false` if
    /// it has settled and the manager should stop tracking it as
    /// outstanding work.
    fn evaluate(self: Arc<Self>) -> bool;

    fn add_dependent(&self, dependent: Weak<dyn AnyNode>);
    fn remove_dependent(&self, id: NodeId);

    /// Enqueues every live dependent of this node onto the manager's
    /// dirty queue. Called after a successful, non-suppressed publish.
    fn enqueue_dependents(&self);
}

struct SnapshotInner<T> {
    value: T,
    node: NodeId,
    version: u64,
    root_version: u64,
}

/// An immutable, cheaply-cloneable handle to one published value of a
/// node. Dereferences to the value itself, matching the spec's "the
/// implicit dereference operator is equivalent [to `get_snapshot`]"
/// wording; grounded in `Observation<T>: Deref` from the single-threaded
/// observable example in the retrieval pack, adapted to be `Arc`-backed so
/// it survives independently of the node's current state.
pub struct Snapshot<T> {
    inner: Arc<SnapshotInner<T>>,
}

impl<T> Snapshot<T> {
    /// The id of the node this snapshot was published by.
    pub fn node_id(&self) -> NodeId {
        self.inner.node
    }

    /// The node-local version of this snapshot. Strictly increasing for a
    /// single node (Invariant 3 / Ordering guarantee 4).
    pub fn version(&self) -> u64 {
        self.inner.version
    }

    /// The highest source epoch that contributed to this value.
    pub fn root_version(&self) -> u64 {
        self.inner.root_version
    }
}

impl<T> std::ops::Deref for Snapshot<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.inner.value
    }
}

impl<T> Clone for Snapshot<T> {
    fn clone(&self) -> Self {
        Snapshot {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Snapshot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Snapshot")
            .field("node", &self.inner.node)
            .field("version", &self.inner.version)
            .field("root_version", &self.inner.root_version)
            .field("value", &self.inner.value)
            .finish()
    }
}

pub(crate) struct CallbackSlot<T> {
    pub(crate) active: Arc<std::sync::atomic::AtomicBool>,
    pub(crate) f: Arc<dyn Fn(Snapshot<T>) + Send + Sync>,
}

type EqualityFn<T> = Box<dyn Fn(&T, &T) -> bool + Send + Sync>;
type EvalFn<T> = Box<dyn Fn() -> Result<T, ()> + Send + Sync>;
type GetFn<T> = Box<dyn Fn() -> T + Send + Sync>;

/// Shared state for a poll-with-callback source's in-flight `get()` calls,
/// so destruction can block until none remain (see `source.rs`).
pub(crate) struct PollGuardState {
    count: Mutex<usize>,
    cv: Condvar,
}

impl PollGuardState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(PollGuardState {
            count: Mutex::new(0),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn wait_for_zero(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.cv.wait(&mut count);
        }
    }
}

struct InflightGuard<'a>(&'a PollGuardState);

impl<'a> InflightGuard<'a> {
    fn enter(state: &'a PollGuardState) -> Self {
        *state.count.lock() += 1;
        InflightGuard(state)
    }
}

impl<'a> Drop for InflightGuard<'a> {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.cv.notify_all();
        }
    }
}

pub(crate) enum NodeKind<T> {
    /// A `Source<T>`: published only via explicit `set`, never evaluated
    /// by the manager.
    SetSource,
    /// A `PollSource<T>`: evaluated by invoking the user's `get`. Produces
    /// an empty dependency set, since `get` doesn't read other nodes.
    Poll { get: GetFn<T>, guard: Arc<PollGuardState> },
    /// A `make_observer`/`make_value_observer` node.
    Derived {
        eval: EvalFn<T>,
        equality: Option<EqualityFn<T>>,
    },
}

struct NodeInner<T> {
    state: NodeState,
    /// Set while `Evaluating` if another dirty-trigger arrives before this
    /// evaluation finishes; on completion the node is re-run instead of
    /// settling, per the spec's "dirty-again" scheduling rule.
    reenqueue: bool,
    dependencies: FxIndexMap<NodeId, Arc<dyn AnyNode>>,
    dependents: SmallVec<[Weak<dyn AnyNode>; 4]>,
    subscriptions: Vec<CallbackSlot<T>>,
}

/// The core reactive cell. Generic over the published value type; type
/// erasure for cross-node references happens through `AnyNode`.
pub(crate) struct Node<T> {
    id: NodeId,
    published: RwLock<Arc<SnapshotInner<T>>>,
    inner: Mutex<NodeInner<T>>,
    kind: NodeKind<T>,
}

impl<T: Send + Sync + 'static> Node<T> {
    pub(crate) fn new_source(initial: T, root_version: u64) -> Arc<Self> {
        let id = NodeId::next();
        Arc::new(Node {
            id,
            published: RwLock::new(Arc::new(SnapshotInner {
                value: initial,
                node: id,
                version: 1,
                root_version,
            })),
            inner: Mutex::new(NodeInner {
                state: NodeState::Fresh,
                reenqueue: false,
                dependencies: FxIndexMap::default(),
                dependents: SmallVec::new(),
                subscriptions: Vec::new(),
            }),
            kind: NodeKind::SetSource,
        })
    }

    /// Builds a poll source and runs its first `get()` synchronously, so
    /// construction is not complete until an initial value exists (mirrors
    /// derived-observer construction, §5 suspension points).
    pub(crate) fn new_poll(get: GetFn<T>, guard: Arc<PollGuardState>) -> Arc<Self> {
        let id = NodeId::next();
        let initial = {
            let _inflight = InflightGuard::enter(&guard);
            get()
        };
        Arc::new(Node {
            id,
            published: RwLock::new(Arc::new(SnapshotInner {
                value: initial,
                node: id,
                version: 1,
                root_version: 0,
            })),
            inner: Mutex::new(NodeInner {
                state: NodeState::Fresh,
                reenqueue: false,
                dependencies: FxIndexMap::default(),
                dependents: SmallVec::new(),
                subscriptions: Vec::new(),
            }),
            kind: NodeKind::Poll { get, guard },
        })
    }

    /// Builds a derived node and performs its mandatory initial
    /// synchronous evaluation (§3 Lifecycle: "the manager performs an
    /// initial synchronous evaluation before the constructor returns").
    ///
    /// The evaluator runs *before* the node (and therefore any `Arc`
    /// handle to it) exists, so a panic or nil result here simply
    /// propagates straight out to the caller uncaught — there is nothing
    /// to clean up yet. This is the one place evaluation failure is not a
    /// local, recoverable event (`InitialEvaluationFailure`); every later
    /// failure goes through `evaluate` below instead, which always runs
    /// with a real `Arc<Self>` already wired into the graph.
    pub(crate) fn new_derived(eval: EvalFn<T>, equality: Option<EqualityFn<T>>) -> Arc<Self> {
        let id = NodeId::next();

        recorder::push_frame(id);
        struct FrameGuard(bool);
        impl Drop for FrameGuard {
            fn drop(&mut self) {
                if !self.0 {
                    let _ = recorder::pop_frame();
                }
            }
        }
        let mut guard = FrameGuard(false);
        let result = eval();
        guard.0 = true;
        let reads = recorder::pop_frame();
        drop(guard);

        let value = match result {
            Ok(v) => v,
            Err(()) => {
                let err = EvalError::NilResult(id);
                warn!("{}", err);
                panic!("{}", err);
            }
        };
        let root_version = reads.values().map(|d| d.root_version()).max().unwrap_or(0);

        let node = Arc::new(Node {
            id,
            published: RwLock::new(Arc::new(SnapshotInner {
                value,
                node: id,
                version: 1,
                root_version,
            })),
            inner: Mutex::new(NodeInner {
                state: NodeState::Fresh,
                reenqueue: false,
                dependencies: FxIndexMap::default(),
                dependents: SmallVec::new(),
                subscriptions: Vec::new(),
            }),
            kind: NodeKind::Derived { eval, equality },
        });

        let node_dyn: Arc<dyn AnyNode> = node.clone();
        let self_weak: Weak<dyn AnyNode> = Arc::downgrade(&node_dyn);
        for dep in reads.values() {
            dep.add_dependent(self_weak.clone());
        }
        node.inner.lock().dependencies = reads;

        node
    }

    fn invoke_kind(&self) -> Result<T, ()> {
        match &self.kind {
            NodeKind::SetSource => unreachable!("source nodes are never evaluated"),
            NodeKind::Poll { get, guard } => {
                let _inflight = InflightGuard::enter(guard);
                Ok(get())
            }
            NodeKind::Derived { eval, .. } => eval(),
        }
    }

    fn install_dependencies(&self, self_weak: &Weak<dyn AnyNode>, reads: FxIndexMap<NodeId, Arc<dyn AnyNode>>) {
        let mut inner = self.inner.lock();
        for (old_id, old_dep) in inner.dependencies.iter() {
            if !reads.contains_key(old_id) {
                old_dep.remove_dependent(self.id);
            }
        }
        for (new_id, new_dep) in reads.iter() {
            if !inner.dependencies.contains_key(new_id) {
                new_dep.add_dependent(self_weak.clone());
            }
        }
        inner.dependencies = reads;
    }

    fn compute_root_version(&self) -> u64 {
        let inner = self.inner.lock();
        inner
            .dependencies
            .values()
            .map(|d| d.root_version())
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn current_snapshot(&self) -> Snapshot<T> {
        if self.inner.lock().state == NodeState::Evaluating {
            debug!(
                "{:?}: read by {:?} while still evaluating; cycle-break taken, \
                 returning last published snapshot",
                self.id,
                recorder::current_node_id()
            );
        }
        Snapshot {
            inner: self.published.read().clone(),
        }
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn push_subscription(&self, slot: CallbackSlot<T>) {
        self.inner.lock().subscriptions.push(slot);
    }

    fn publish_and_notify(&self, value: T, root_version: u64) {
        let mut published = self.published.write();
        let version = published.version + 1;
        *published = Arc::new(SnapshotInner {
            value,
            node: self.id,
            version,
            root_version,
        });
        let snapshot = Snapshot {
            inner: published.clone(),
        };
        drop(published);
        self.notify_subscribers(snapshot);
    }

    fn notify_subscribers(&self, snapshot: Snapshot<T>) {
        let mut inner = self.inner.lock();
        inner
            .subscriptions
            .retain(|slot| slot.active.load(Ordering::SeqCst));
        let fns: Vec<_> = inner
            .subscriptions
            .iter()
            .map(|slot| slot.f.clone())
            .collect();
        drop(inner);
        for f in fns {
            f(snapshot.clone());
        }
    }

    pub(crate) fn set_source(&self, value: T, root_version: u64) {
        trace!("{:?}: source set, root_version={}", self.id, root_version);
        self.publish_and_notify(value, root_version);
        self.enqueue_dependents();
    }
}

impl<T: Send + Sync + 'static> AnyNode for Node<T> {
    fn id(&self) -> NodeId {
        self.id
    }

    fn root_version(&self) -> u64 {
        self.published.read().root_version
    }

    fn state(&self) -> NodeState {
        self.inner.lock().state
    }

    fn mark_dirty(self: Arc<Self>) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            NodeState::Fresh | NodeState::Failed => {
                inner.state = NodeState::Dirty;
                true
            }
            NodeState::Dirty => false,
            NodeState::Evaluating => {
                inner.reenqueue = true;
                false
            }
        }
    }

    fn evaluate(self: Arc<Self>) -> bool {
        {
            let mut inner = self.inner.lock();
            inner.state = NodeState::Evaluating;
            inner.reenqueue = false;
        }

        let id = self.id;
        recorder::push_frame(id);
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| self.invoke_kind()));
        let reads = recorder::pop_frame();

        let published = match outcome {
            Ok(Ok(value)) => {
                let self_dyn: Arc<dyn AnyNode> = self.clone();
                let self_weak: Weak<dyn AnyNode> = Arc::downgrade(&self_dyn);
                self.install_dependencies(&self_weak, reads);
                let root_version = self.compute_root_version();
                let suppressed = match &self.kind {
                    NodeKind::Derived {
                        equality: Some(eq), ..
                    } => eq(&self.published.read().value, &value),
                    _ => false,
                };
                if suppressed {
                    trace!("{:?}: evaluation suppressed (value unchanged)", id);
                    false
                } else {
                    self.publish_and_notify(value, root_version);
                    true
                }
            }
            Ok(Err(())) => {
                // A nil result on a non-initial evaluation is a routine,
                // recoverable event: the node keeps its prior published
                // value and a later dirty-trigger will retry it.
                let err = EvalError::NilResult(id);
                debug!("{}", err);
                false
            }
            Err(payload) => {
                let err = EvalError::Panic(id, payload);
                if matches!(&self.kind, NodeKind::Poll { .. }) {
                    warn!("{}", err);
                } else {
                    debug!("{}", err);
                }
                false
            }
        };

        let mut inner = self.inner.lock();
        let reenqueue = inner.reenqueue;
        inner.state = if published {
            NodeState::Fresh
        } else if reenqueue {
            NodeState::Dirty
        } else {
            NodeState::Failed
        };
        drop(inner);

        if published {
            debug!("{:?}: published new snapshot", id);
            self.enqueue_dependents();
        }

        reenqueue
    }

    fn add_dependent(&self, dependent: Weak<dyn AnyNode>) {
        self.inner.lock().dependents.push(dependent);
    }

    fn remove_dependent(&self, id: NodeId) {
        self.inner
            .lock()
            .dependents
            .retain(|d| d.upgrade().map_or(false, |d| d.id() != id));
    }

    fn enqueue_dependents(&self) {
        let dependents: Vec<_> = {
            let mut inner = self.inner.lock();
            inner.dependents.retain(|d| d.strong_count() > 0);
            inner
                .dependents
                .iter()
                .filter_map(|d| d.upgrade())
                .collect()
        };
        for dep in dependents {
            crate::manager::global().enqueue(dep);
        }
    }
}
