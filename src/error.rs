/// Error taxonomy for the execution engine
///
/// Store failures travel as `anyhow::Error` (the persistence layer's native error type)
/// and are lifted into `EngineError::Store` at the engine boundary.

use crate::runtime::testing::ValidationIssue;
use thiserror::Error;

/// Errors surfaced by engine entry points
#[derive(Debug, Error)]
pub enum EngineError {
    /// A pipeline, execution, node or job does not exist
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// The pipeline has no node without incoming edges
    #[error("pipeline '{0}' has no trigger nodes")]
    NoTriggerNodes(String),

    /// The operation is not valid for the current status
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A node handler failed. Recorded on the NodeResult and in the logs, never returned
    /// from engine entry points.
    #[error("node '{node_id}' failed: {message}")]
    NodeExecution { node_id: String, message: String },

    /// Pre-flight validation produced blocking issues
    #[error("pipeline validation failed with {} issue(s)", .0.len())]
    Validation(Vec<ValidationIssue>),

    /// Job queue enqueue/dequeue failure
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Execution or pipeline store failure
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { kind, id: id.into() }
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }
}

/// Errors raised by job queue implementations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("queue rejected job: {0}")]
    Rejected(String),

    #[error("queue '{0}' is closed")]
    Closed(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_message_names_kind_and_id() {
        let err = EngineError::not_found("execution", "exec-1");
        assert_eq!(err.to_string(), "execution not found: exec-1");
    }

    #[test]
    fn queue_errors_convert_transparently() {
        let err: EngineError = QueueError::JobNotFound("job-9".into()).into();
        assert!(matches!(err, EngineError::Queue(QueueError::JobNotFound(_))));
        assert_eq!(err.to_string(), "job not found: job-9");
    }
}
