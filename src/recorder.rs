//! Per-thread dependency recorder.
//!
//! Grounded in the teacher's `report_query_read`/`LocalState` pattern
//! (`runtime.rs`): a per-thread stack of "what is currently being
//! evaluated" frames, pushed and popped around each evaluator invocation.
//! Unlike the teacher, which uses this to populate a pull-model memoization
//! table, here the recorded reads become the node's new dependency set once
//! the evaluator returns (see `node.rs::Node::evaluate`).
//!
//! The stack (rather than a single slot) is what makes re-entrant
//! `make_observer` calls during another evaluator's execution work: a
//! nested construction pushes its own frame, runs to completion, and pops
//! it, leaving the outer frame exactly as it was.

use crate::node::{AnyNode, NodeId};
use crate::FxIndexMap;
use std::cell::RefCell;
use std::sync::Arc;

struct Frame {
    node: NodeId,
    reads: RefCell<FxIndexMap<NodeId, Arc<dyn AnyNode>>>,
}

thread_local! {
    static STACK: RefCell<Vec<Frame>> = RefCell::new(Vec::new());
}

/// Pushes a new recording frame for `node`, the node about to be evaluated
/// on this thread.
pub(crate) fn push_frame(node: NodeId) {
    STACK.with(|s| {
        s.borrow_mut().push(Frame {
            node,
            reads: RefCell::new(FxIndexMap::default()),
        })
    });
}

/// Pops the current frame and returns the set of nodes it recorded, in
/// first-read order.
pub(crate) fn pop_frame() -> FxIndexMap<NodeId, Arc<dyn AnyNode>> {
    STACK.with(|s| {
        s.borrow_mut()
            .pop()
            .expect("pop_frame called with no active frame")
            .reads
            .into_inner()
    })
}

/// Records that `node`'s snapshot was read by whichever evaluation is on
/// top of this thread's stack, if any. A no-op outside of evaluation
/// (e.g. a plain `get_snapshot()` call from ordinary application code).
pub(crate) fn record_read(node: Arc<dyn AnyNode>) {
    STACK.with(|s| {
        if let Some(frame) = s.borrow().last() {
            frame.reads.borrow_mut().entry(node.id()).or_insert(node);
        }
    });
}

/// True if this thread is currently inside an evaluator. Used to reject
/// `wait_for_all_updates()` calls made from within one (`QuiescenceFromEvaluator`).
pub(crate) fn is_inside_evaluation() -> bool {
    STACK.with(|s| !s.borrow().is_empty())
}

/// The node id of the innermost evaluation active on this thread, if any.
pub(crate) fn current_node_id() -> Option<NodeId> {
    STACK.with(|s| s.borrow().last().map(|f| f.node))
}
