//! Structured error types for the queue core.
//!
//! `QueueError` is the only error type submitters see; `anyhow::Error` stays
//! internal to processors. Store failures on the critical path surface as
//! `QueueError::Store`; best-effort telemetry paths log and continue instead.

use thiserror::Error;
use uuid::Uuid;

use crate::store::StoreError;

/// Errors surfaced to submitters and admins.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue name is not configured.
    #[error("unknown queue: {0}")]
    InvalidQueue(String),

    /// No job with this id exists in the queue.
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// No dead-letter item with this id exists.
    #[error("dead-letter item not found: {0}")]
    DlqItemNotFound(String),

    /// The item has been resurrected too many times already.
    #[error("resurrection limit reached for dead-letter item {0}")]
    ResurrectionLimit(String),

    /// No scheduled job with this id exists.
    #[error("scheduled job not found: {0}")]
    ScheduleNotFound(String),

    /// The schedule expression could not be parsed.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// The underlying store failed on a critical-path operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A persisted record could not be decoded.
    #[error("corrupt record: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_subject() {
        let err = QueueError::InvalidQueue("nope".to_string());
        assert!(err.to_string().contains("nope"));

        let id = Uuid::new_v4();
        let err = QueueError::JobNotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn store_errors_convert() {
        let store_err = StoreError::Backend(anyhow::anyhow!("boom"));
        let err: QueueError = store_err.into();
        assert!(matches!(err, QueueError::Store(_)));
    }
}
