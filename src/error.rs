//! Error types for the sequence engine

use crate::plan::NodeId;
use thiserror::Error;

/// Top-level failure of a sequence run or of plan persistence.
#[derive(Debug, Error)]
pub enum SequenceError {
    /// A node faulted and stopped the run.
    #[error("node {node} failed: {message}")]
    Execution { node: NodeId, message: String },

    /// The persisted document could not be understood.
    #[error("plan format error: {0}")]
    Format(String),
}

/// Rejected plan edit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("plan cannot be edited while a run is in progress")]
    Running,

    #[error("no such node: {0}")]
    UnknownNode(NodeId),

    #[error("node {0} is not a container")]
    NotAContainer(NodeId),

    #[error("attaching node {0} would create a cycle")]
    Cycle(NodeId),
}

/// Outcome of one action or trigger body.
///
/// Cancellation is not a fault: it propagates as its own variant so the
/// coordinator can unwind without marking nodes failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ItemError {
    #[error("cancelled")]
    Cancelled,

    #[error("{0}")]
    Failed(String),
}

impl From<String> for ItemError {
    fn from(message: String) -> Self {
        ItemError::Failed(message)
    }
}
