//! Observable source nodes: the two leaf variants described in §4.3 — a
//! plain set-value source, and a poll-with-callback source wrapping an
//! externally-owned data feed.

use crate::manager;
use crate::node::{Node, PollGuardState};
use crate::observer::Observer;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// An externally-writable leaf node. `set` is non-blocking: it publishes
/// immediately and hands dependents to the manager's dirty queue rather
/// than recomputing them inline.
pub struct Source<T> {
    node: Arc<Node<T>>,
}

impl<T: Send + Sync + 'static> Source<T> {
    /// Creates a source with an initial value. The initial snapshot
    /// carries root_version 0: it predates any update epoch, so it never
    /// outranks a later `set` when a derived node's root_version is
    /// computed as the max over its dependencies.
    pub fn new(initial: T) -> Self {
        let _ = manager::global();
        Source {
            node: Node::new_source(initial, 0),
        }
    }

    /// Creates a source using `T::default()` as the initial value.
    pub fn new_default() -> Self
    where
        T: Default,
    {
        Self::new(T::default())
    }

    /// Overwrites the source's value, incrementing the global update
    /// epoch and enqueuing every dependent for re-evaluation. Multiple
    /// rapid calls may coalesce: only the most recent value survives if a
    /// dependent hasn't been dequeued yet.
    pub fn set(&self, value: T) {
        let epoch = manager::global().next_epoch();
        self.node.set_source(value, epoch);
    }

    /// Obtains a reader handle to this source's node.
    pub fn observer(&self) -> Observer<T> {
        Observer::from_node(self.node.clone())
    }
}

/// A source backed by an external `{get, subscribe, unsubscribe}` triple
/// (§4.3). `get` is invoked once synchronously at construction and again
/// on every external-change notification; `unsubscribe` plus a join on any
/// in-flight `get` runs at drop time, so the source is never freed while a
/// refresh could still be touching it.
pub struct PollSource<T> {
    node: Arc<Node<T>>,
    guard: Arc<PollGuardState>,
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl<T: Send + Sync + 'static> PollSource<T> {
    /// `subscribe` is handed an internal callback; invoking it (from any
    /// thread, at any time, including reentrantly) enqueues a refresh.
    /// The callback remains safe to call even after the `PollSource` is
    /// dropped — it simply becomes a no-op once the node is gone.
    pub fn new<G, S, U>(get: G, subscribe: S, unsubscribe: U) -> Self
    where
        G: Fn() -> T + Send + Sync + 'static,
        S: FnOnce(Box<dyn Fn() + Send + Sync>),
        U: FnOnce() + Send + 'static,
    {
        let guard = PollGuardState::new();
        let node = Node::new_poll(Box::new(get), guard.clone());

        let node_dyn: Arc<dyn crate::node::AnyNode> = node.clone();
        let weak: std::sync::Weak<dyn crate::node::AnyNode> = Arc::downgrade(&node_dyn);
        subscribe(Box::new(move || {
            if let Some(node) = weak.upgrade() {
                manager::global().enqueue(node);
            }
        }));

        PollSource {
            node,
            guard,
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Obtains a reader handle to this poll source's node.
    pub fn observer(&self) -> Observer<T> {
        Observer::from_node(self.node.clone())
    }
}

impl<T> Drop for PollSource<T> {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            // `unsubscribe` is an externally-owned callback that may, in
            // turn, read other nodes — run it on the manager's worker pool
            // rather than inline on whatever thread happens to be dropping
            // this source, then block here until it has actually run.
            let done = Arc::new((Mutex::new(false), Condvar::new()));
            let done_for_task = done.clone();
            manager::global().run_on_manager_thread(move || {
                unsubscribe();
                let (finished, cv) = &*done_for_task;
                *finished.lock() = true;
                cv.notify_all();
            });
            let (finished, cv) = &*done;
            let mut finished = finished.lock();
            while !*finished {
                cv.wait(&mut finished);
            }
        }
        // Destruction is not complete until no further `get` can start
        // and any refresh already in flight has returned.
        self.guard.wait_for_zero();
    }
}
