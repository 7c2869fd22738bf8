//! Structured error types for the workflow engine.
//!
//! `WorkflowError` is the only error type submitters see. Step handlers use
//! `anyhow::Result` internally; their failures surface as workflow state
//! (`FAILED` with a `failure_reason`), never as swallowed errors.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the workflow engine.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// No workflow with this id exists.
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// No definition registered under this type.
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// The requested state change is not in the transition table. Nothing
    /// was mutated.
    #[error("invalid state transition for {entity}: {from} -> {to}")]
    InvalidStateTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Only FAILED workflows can be retried.
    #[error("workflow {id} is not recoverable in state {state}")]
    NotRecoverable { id: Uuid, state: String },

    /// A step exhausted its retries.
    #[error("step {step} failed after {attempts} attempts: {reason}")]
    StepFailed {
        step: String,
        attempts: u32,
        reason: String,
    },

    /// A compensation handler threw; progress stopped.
    #[error("compensation failed at step {step}: {reason}")]
    CompensationFailed { step: String, reason: String },

    /// The definition and persisted rows disagree.
    #[error("workflow {id} has no step at index {index}")]
    StepMissing { id: Uuid, index: i32 },

    /// The backing store failed.
    #[error("workflow storage error: {0}")]
    Storage(#[source] anyhow::Error),

    /// A queue operation performed on behalf of a step failed.
    #[error(transparent)]
    Queue(#[from] conveyor::QueueError),
}

impl From<sqlx::Error> for WorkflowError {
    fn from(err: sqlx::Error) -> Self {
        WorkflowError::Storage(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_context() {
        let err = WorkflowError::InvalidStateTransition {
            entity: "workflow",
            from: "completed".to_string(),
            to: "running".to_string(),
        };
        assert!(err.to_string().contains("completed -> running"));

        let err = WorkflowError::StepFailed {
            step: "deploy_contract".to_string(),
            attempts: 3,
            reason: "ETIMEDOUT".to_string(),
        };
        assert!(err.to_string().contains("deploy_contract"));
        assert!(err.to_string().contains("3"));
    }
}
