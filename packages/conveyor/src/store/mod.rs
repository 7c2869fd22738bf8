//! The key-value store every durable structure sits on.
//!
//! Conveyor persists everything (job records, ready/delayed queues, the
//! dead-letter queue, metrics history, the scheduled-job registry) through
//! one narrow interface shaped like Redis: ordered lists, hashes, sorted
//! sets, and scalars with a TTL.
//!
//! # The Contract
//!
//! 1. **Each operation is individually atomic.** No cross-key transactions
//!    are offered or required.
//!
//! 2. **Failures are explicit.** Every operation returns [`StoreError`].
//!    Telemetry callers treat failures as best-effort and keep going;
//!    critical-path callers (enqueue, dead-letter moves) propagate them.
//!
//! 3. **Values are strings.** Callers serialize records to JSON before
//!    writing, exactly as they would against a real Redis.
//!
//! Two backends ship: [`RedisStore`] over a managed async connection, and
//! [`MemoryStore`], an embedded equivalent used by tests and single-node
//! deployments.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::{RedisStore, StoreConfig};

/// Errors from the key-value store.
///
/// The distinction matters to callers:
/// - [`StoreError::Unavailable`] means the backend cannot be reached at all.
///   On the critical path this surfaces to the submitter as `StoreUnavailable`.
/// - [`StoreError::Backend`] means a single operation failed (bad reply,
///   serialization at the wire level, timeout on one command).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store backend cannot be reached.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),

    /// A single store operation failed.
    #[error("store operation failed: {0}")]
    Backend(#[source] anyhow::Error),
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_connection_refusal() || err.is_io_error() || err.is_connection_dropped() {
            StoreError::Unavailable(err.into())
        } else {
            StoreError::Backend(err.into())
        }
    }
}

/// A member of a sorted set together with its score.
pub type ScoredMember = (String, f64);

/// Redis-shaped storage: lists, hashes, sorted sets, scalars with TTL.
///
/// Implementations must make each call individually atomic. See the module
/// docs for the full contract.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    // --- Ordered lists ---

    /// Push a value onto the head of a list.
    async fn list_push_head(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Push a value onto the tail of a list.
    async fn list_push_tail(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Return the inclusive range `[start, stop]`. Negative indices count
    /// from the tail, Redis-style (`-1` is the last element).
    async fn list_range(&self, key: &str, start: isize, stop: isize)
        -> Result<Vec<String>, StoreError>;

    /// Trim the list to the inclusive range `[start, stop]`.
    async fn list_trim(&self, key: &str, start: isize, stop: isize) -> Result<(), StoreError>;

    /// Remove all occurrences of `value`. Returns the number removed.
    async fn list_remove(&self, key: &str, value: &str) -> Result<u64, StoreError>;

    /// Length of the list (0 for a missing key).
    async fn list_len(&self, key: &str) -> Result<u64, StoreError>;

    // --- Hashes ---

    /// Set a hash field.
    async fn hash_set(&self, key: &str, field: &str, value: &str) -> Result<(), StoreError>;

    /// Get a single hash field.
    async fn hash_get(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Get every field of a hash (empty map for a missing key).
    async fn hash_get_all(&self, key: &str) -> Result<HashMap<String, String>, StoreError>;

    /// Increment a numeric hash field, returning the new value.
    async fn hash_incr(&self, key: &str, field: &str, delta: i64) -> Result<i64, StoreError>;

    /// Delete a hash field. Returns whether it existed.
    async fn hash_del(&self, key: &str, field: &str) -> Result<bool, StoreError>;

    // --- Sorted sets ---

    /// Add a member with a score, replacing any existing score.
    async fn zset_add(&self, key: &str, member: &str, score: f64) -> Result<(), StoreError>;

    /// Members with `min <= score <= max`, ascending, optionally limited.
    async fn zset_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<usize>,
    ) -> Result<Vec<String>, StoreError>;

    /// Atomically pop up to `count` lowest-scored members.
    async fn zset_pop_min(&self, key: &str, count: usize) -> Result<Vec<ScoredMember>, StoreError>;

    /// Remove a member. Returns whether it existed.
    async fn zset_remove(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    /// Cardinality of the set (0 for a missing key).
    async fn zset_card(&self, key: &str) -> Result<u64, StoreError>;

    /// Remove members with `min <= score <= max`. Returns the number removed.
    async fn zset_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> Result<u64, StoreError>;

    // --- Scalars ---

    /// Set a scalar that expires after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Get a scalar (respecting expiry).
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Delete a key of any type.
    async fn del(&self, key: &str) -> Result<(), StoreError>;
}

/// Key layout for everything conveyor persists.
///
/// All keys live under the `queue:` prefix so one store instance can be
/// shared with other subsystems.
pub mod keys {
    /// Hash of job id → serialized job record.
    pub fn jobs(queue: &str) -> String {
        format!("queue:jobs:{queue}")
    }

    /// Sorted set of ready job ids, scored by priority band + enqueue time.
    pub fn wait(queue: &str) -> String {
        format!("queue:wait:{queue}")
    }

    /// Sorted set of not-yet-ready job ids, scored by ready-at epoch ms.
    pub fn delayed(queue: &str) -> String {
        format!("queue:delayed:{queue}")
    }

    /// List of currently executing job ids.
    pub fn active(queue: &str) -> String {
        format!("queue:active:{queue}")
    }

    /// List of recently completed job ids, newest first.
    pub fn completed(queue: &str) -> String {
        format!("queue:completed:{queue}")
    }

    /// List of terminally failed job ids, newest first.
    pub fn failed(queue: &str) -> String {
        format!("queue:failed:{queue}")
    }

    /// Hash of lifetime counters for a queue.
    pub fn counts(queue: &str) -> String {
        format!("queue:counts:{queue}")
    }

    /// Main dead-letter list, newest first.
    pub fn dlq_main(queue: &str) -> String {
        format!("queue:dlq:enhanced:{queue}")
    }

    /// Per-category dead-letter sublist.
    pub fn dlq_category(queue: &str, category: &str) -> String {
        format!("queue:dlq:category:{queue}:{category}")
    }

    /// Dead-letter metadata hash (retryable / nonRetryable / total).
    pub fn dlq_meta(queue: &str) -> String {
        format!("queue:dlq:meta:{queue}")
    }

    /// Sorted set of scheduled auto-retries, scored by next-retry epoch ms.
    pub fn dlq_retry(queue: &str) -> String {
        format!("queue:dlq:retry:{queue}")
    }

    /// Hash of resurrection outcomes, id → serialized record.
    pub fn dlq_retried(queue: &str) -> String {
        format!("queue:dlq:retried:{queue}")
    }

    /// Sorted-set index of metric sample timestamps.
    pub fn metrics_index(queue: &str) -> String {
        format!("queue:metrics:{queue}")
    }

    /// Hash of timestamp → serialized metric sample.
    pub fn metrics_data(queue: &str) -> String {
        format!("queue:metrics:{queue}:data")
    }

    /// Cached trend analysis (TTL 1 h).
    pub fn trends(queue: &str) -> String {
        format!("queue:trends:{queue}")
    }

    /// Cached 24 h predictions (TTL 30 min).
    pub fn predictions(queue: &str) -> String {
        format!("queue:predictions:{queue}")
    }

    /// Hash of queue → latest health report.
    pub fn health_status() -> String {
        "queue:health-status".to_string()
    }

    /// Hash of queue → latest scaling suggestion.
    pub fn scaling_suggestions() -> String {
        "queue:scaling-suggestions".to_string()
    }

    /// Sorted set of historical health scores, scored by epoch ms.
    pub fn health_history(queue: &str) -> String {
        format!("queue:health-history:{queue}")
    }

    /// Hash of scheduled-job id → serialized record.
    pub fn scheduled_jobs() -> String {
        "queue:scheduled-jobs".to_string()
    }

    /// List of chained submissions fired after a scheduled job runs.
    pub fn chained_jobs(id: &str) -> String {
        format!("queue:chained-jobs:{id}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_scoped_by_queue() {
        assert_eq!(keys::jobs("tts"), "queue:jobs:tts");
        assert_eq!(keys::dlq_main("tts"), "queue:dlq:enhanced:tts");
        assert_eq!(
            keys::dlq_category("tts", "timeout-error"),
            "queue:dlq:category:tts:timeout-error"
        );
        assert_eq!(keys::metrics_data("tts"), "queue:metrics:tts:data");
        assert_eq!(keys::chained_jobs("abc"), "queue:chained-jobs:abc");
    }
}
