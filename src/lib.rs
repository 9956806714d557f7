#![warn(rust_2018_idioms)]

//! `propagate` is a reactive value-propagation engine: a DAG of observed
//! values where writing to a source automatically, eagerly recomputes
//! every value that transitively depends on it, without the caller ever
//! naming the dependency graph explicitly.
//!
//! Two kinds of leaf nodes feed the graph: [`Source`], set explicitly by
//! application code, and [`PollSource`], wrapping an externally-owned
//! value with a change notification. Everything else is a derived node
//! built with [`make_observer`] or [`make_value_observer`]: its evaluator
//! closure calls [`Observer::get_snapshot`] on whatever nodes it needs,
//! and those calls are recorded automatically to become its dependency
//! set, re-derived fresh on every evaluation.
//!
//! Recomputation happens on a process-wide worker pool; reads never block
//! on it; [`wait_for_all_updates`] is provided for tests and batch jobs
//! that need to observe a quiescent graph.

mod errors;
mod manager;
mod node;
mod observer;
mod recorder;
mod source;

pub use crate::errors::{EvalError, EvalOutcome, QuiescenceFromEvaluator};
pub use crate::node::{NodeId, Snapshot};
pub use crate::observer::{make_observer, make_value_observer, CallbackHandle, Observer};
pub use crate::source::{PollSource, Source};

/// `rustc-hash`-keyed `IndexMap`, used wherever a node needs deterministic
/// (first-read order) iteration over a keyed set without the overhead of
/// `std::collections::HashMap`'s default hasher. Mirrors the teacher's own
/// `FxIndexMap`/`FxIndexSet` typedefs in `runtime.rs`.
pub(crate) type FxIndexMap<K, V> =
    indexmap::IndexMap<K, V, std::hash::BuildHasherDefault<rustc_hash::FxHasher>>;

/// Blocks the calling thread until the dirty queue is empty and no worker
/// is mid-evaluation — i.e. until every effect of every `set()` call made
/// so far has fully propagated.
///
/// # Panics
/// Panics with [`QuiescenceFromEvaluator`] if called from inside a running
/// evaluator (on a worker thread): that would deadlock the manager, since
/// the very worker being asked to wait would never come back around to
/// drain the queue it's waiting on.
pub fn wait_for_all_updates() {
    manager::global().wait_for_all_updates();
}
