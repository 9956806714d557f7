//! The reader-side handle: `Observer<T>`, `make_observer`, and the
//! callback-subscription machinery.
//!
//! Grounded in the single-threaded `Observable<T>`/`Observer<T>` split from
//! the retrieval pack's `aji-ircd-oxide` example, generalized from a
//! single-subscriber future-completion model to a multi-subscriber,
//! multi-publish one backed by `Node<T>`'s subscription list.

use crate::node::{CallbackSlot, Node, Snapshot};
use crate::{errors::EvalOutcome, recorder};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A reader handle onto one node in the graph. Cloning an `Observer` is
/// cheap and yields another handle to the same underlying node, not a copy
/// of its value.
pub struct Observer<T> {
    node: Arc<Node<T>>,
}

impl<T> Clone for Observer<T> {
    fn clone(&self) -> Self {
        Observer {
            node: self.node.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Observer<T> {
    pub(crate) fn from_node(node: Arc<Node<T>>) -> Self {
        Observer { node }
    }

    /// Returns the node's current published snapshot. If called from
    /// inside another node's evaluator, this also records a dependency
    /// edge from the node being evaluated onto this one — the mechanism
    /// that makes dependency tracking automatic.
    pub fn get_snapshot(&self) -> Snapshot<T> {
        recorder::record_read(self.node.clone());
        self.node.current_snapshot()
    }

    /// Registers `callback` to run after every successful, non-suppressed
    /// publish of this node, and once immediately with the current
    /// snapshot so subscribers don't have to separately call
    /// `get_snapshot` to learn the starting value.
    ///
    /// The returned handle owns the subscription: dropping it (or calling
    /// `cancel()` explicitly) unregisters the callback. There is no
    /// ordering guarantee between callbacks on the same node, and none
    /// between callbacks on different nodes that happened to be triggered
    /// by the same update.
    pub fn add_callback<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(Snapshot<T>) + Send + Sync + 'static,
    {
        let active = Arc::new(AtomicBool::new(true));
        let f: Arc<dyn Fn(Snapshot<T>) + Send + Sync> = Arc::new(callback);
        self.node.push_subscription(CallbackSlot {
            active: active.clone(),
            f: f.clone(),
        });
        f(self.node.current_snapshot());
        CallbackHandle { active }
    }
}

/// Builds a derived node from `evaluator`, running it once synchronously
/// before returning (§3 Lifecycle). `evaluator` may call `get_snapshot` on
/// any number of other observers; every such call made during this first
/// run — and every later re-run triggered by the manager — becomes this
/// node's dependency set for that run.
///
/// # Panics
/// Panics if the first run of `evaluator` returns a nil result (an
/// `Option::None`) or panics itself: a node that cannot produce an initial
/// value cannot be constructed at all.
pub fn make_observer<T, F, R>(evaluator: F) -> Observer<T>
where
    T: Send + Sync + 'static,
    R: EvalOutcome<T>,
    F: Fn() -> R + Send + Sync + 'static,
{
    let node = Node::new_derived(Box::new(move || evaluator().into_outcome()), None);
    Observer::from_node(node)
}

/// Wraps `src` in a "distinct until changed" adapter: the returned
/// observer tracks `src`'s value exactly, but suppresses republishing (and
/// therefore re-enqueuing its own dependents) whenever a re-evaluation
/// produces a value equal to the one already published, per `PartialEq`.
///
/// `src` remains a dependency and is still read on every re-evaluation —
/// only the *publish* is filtered, not the evaluation itself.
pub fn make_value_observer<T>(src: Observer<T>) -> Observer<T>
where
    T: PartialEq + Clone + Send + Sync + 'static,
{
    let node = Node::new_derived(
        Box::new(move || Ok(T::clone(&src.get_snapshot()))),
        Some(Box::new(|a: &T, b: &T| a == b)),
    );
    Observer::from_node(node)
}

/// Owns a callback subscription registered via [`Observer::add_callback`].
/// Dropping the handle cancels the subscription, so reassigning a
/// variable holding one (`handle = observer.add_callback(...)`) can never
/// leak the old callback the way a bare `fn subscribe(...)` API would.
pub struct CallbackHandle {
    active: Arc<AtomicBool>,
}

impl CallbackHandle {
    /// Unregisters the callback. Idempotent; a no-op if already cancelled
    /// or dropped.
    pub fn cancel(&self) {
        self.active.store(false, Ordering::SeqCst);
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}
