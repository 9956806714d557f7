//! Error kinds raised by node evaluation.
//!
//! Only non-initial evaluation failures are represented as data that lives
//! past the moment of failure (`EvalError`, stashed on the node for
//! diagnostics and logging). An evaluator that fails on a node's very first
//! evaluation is a construction-time error and propagates as a panic out of
//! `make_observer`/`PollSource::new` instead, matching the "construction
//! fails" wording of the propagation model this crate implements.

use crate::node::NodeId;
use std::fmt;

/// Why a single evaluation attempt did not produce a publishable value.
///
/// `Panic` keeps the original `Box<dyn Any + Send>` payload rather than
/// eagerly rendering it to a string, so a caller that downcasts panic
/// payloads for its own reporting doesn't lose structure a string would
/// have thrown away. Use [`panic_message`] to get the best-effort string
/// rendering used by this type's own `Display` impl.
pub enum EvalError {
    /// The evaluator returned a nil/empty value where one was required.
    NilResult(NodeId),
    /// The evaluator panicked.
    Panic(NodeId, Box<dyn std::any::Any + Send>),
}

impl EvalError {
    /// The node the failure occurred on.
    pub fn node_id(&self) -> NodeId {
        match self {
            EvalError::NilResult(id) => *id,
            EvalError::Panic(id, _) => *id,
        }
    }

    /// The raw panic payload, if this is a [`EvalError::Panic`].
    pub fn panic_payload(&self) -> Option<&(dyn std::any::Any + Send)> {
        match self {
            EvalError::Panic(_, payload) => Some(&**payload),
            EvalError::NilResult(_) => None,
        }
    }
}

impl fmt::Debug for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::NilResult(id) => f.debug_tuple("NilResult").field(id).finish(),
            EvalError::Panic(id, payload) => f
                .debug_struct("Panic")
                .field("node", id)
                .field("message", &panic_message(payload))
                .finish(),
        }
    }
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvalError::NilResult(id) => write!(
                f,
                "node {:?}: evaluator returned a nil result where a value was required",
                id
            ),
            EvalError::Panic(id, payload) => {
                write!(f, "node {:?}: evaluator panicked: {}", id, panic_message(payload))
            }
        }
    }
}

impl std::error::Error for EvalError {}

/// A programming error: `wait_for_all_updates` was called from inside an
/// evaluator running on a worker thread. This always indicates a bug in the
/// caller (it would deadlock the manager) and is raised as a panic.
#[derive(Debug, Clone, Copy)]
pub struct QuiescenceFromEvaluator;

impl fmt::Display for QuiescenceFromEvaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "wait_for_all_updates() was called from inside an evaluator; \
             this would deadlock the manager and is a programming error"
        )
    }
}

impl std::error::Error for QuiescenceFromEvaluator {}

/// Normalizes an evaluator's return type into success-or-nil.
///
/// Evaluators may return `T` directly (always succeeds) or `Option<T>`
/// (`None` is treated as [`EvalError::NilResult`]). This mirrors how
/// `std::process::Termination` lets `main` return either `()` or a
/// `Result` without the caller needing to know which.
pub trait EvalOutcome<T> {
    /// Converts the raw evaluator output into `Ok(value)` or `Err(())` for
    /// a nil result. The node id is attached by the caller, which is why
    /// this returns a unit error rather than `EvalError` directly.
    fn into_outcome(self) -> Result<T, ()>;
}

impl<T> EvalOutcome<T> for T {
    fn into_outcome(self) -> Result<T, ()> {
        Ok(self)
    }
}

impl<T> EvalOutcome<T> for Option<T> {
    fn into_outcome(self) -> Result<T, ()> {
        self.ok_or(())
    }
}

pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
