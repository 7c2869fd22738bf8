//! Dead-letter queue.
//!
//! Terminally failed jobs land here with their payload preserved verbatim,
//! categorized by error class. Failures that were not permanent are
//! scheduled for automatic resurrection.
//!
//! Layout per queue: a main list (newest first), one sublist per category,
//! a metadata hash with retryable/non-retryable/total counts, a sorted-set
//! retry schedule scored by next-retry epoch ms, and a hash of resurrection
//! outcomes.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::job::Job;
use crate::retry::{Backoff, ErrorCategory};
use crate::store::{keys, Store};

/// Default cap on how often a single item may be resurrected.
pub const DEFAULT_MAX_RESURRECTIONS: u32 = 3;

/// Per-tick cap on scheduled retries, to avoid thundering herds.
const RETRY_BATCH: usize = 100;

/// A terminally failed job, preserved for inspection and resurrection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqItem {
    /// Original job id.
    pub id: String,
    /// Queue the job failed on (and returns to when resurrected).
    pub queue: String,
    pub kind: String,
    /// Original payload, preserved verbatim.
    pub payload: serde_json::Value,
    /// Final error message.
    pub error: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub failed_at: DateTime<Utc>,
    pub category: ErrorCategory,
    /// False iff the error was classified permanent.
    pub can_retry: bool,
    /// When the scheduled auto-retry fires, if any.
    pub next_retry_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resurrection_count: u32,
    #[serde(default)]
    pub resurrection_history: Vec<DateTime<Utc>>,
    // Enough of the original submission to re-enqueue faithfully.
    pub priority: i32,
    pub backoff: Backoff,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl DlqItem {
    /// Build an item from a job that just failed terminally.
    pub fn from_job(
        job: &Job,
        error: &str,
        category: ErrorCategory,
        can_retry: bool,
        next_retry_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id: job.id.to_string(),
            queue: job.queue.clone(),
            kind: job.kind.clone(),
            payload: job.payload.clone(),
            error: error.to_string(),
            attempts: job.attempts_made,
            max_attempts: job.max_attempts,
            failed_at: Utc::now(),
            category,
            can_retry,
            next_retry_at,
            resurrection_count: 0,
            resurrection_history: Vec::new(),
            priority: job.priority,
            backoff: job.backoff.clone(),
            tags: job.tags.clone(),
        }
    }
}

/// Aggregate counters for one queue's dead letters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DlqStats {
    pub total: u64,
    pub retryable: u64,
    pub non_retryable: u64,
    pub scheduled_retries: u64,
    /// Entries skipped because they failed to decode.
    pub invalid_entries: u64,
    pub by_category: std::collections::HashMap<String, u64>,
}

/// Outcome record written when an item is resurrected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetriedRecord {
    pub success: bool,
    pub retried_at: DateTime<Utc>,
}

/// Dead-letter queue over the KV store.
pub struct DeadLetterQueue {
    store: Arc<dyn Store>,
    max_resurrections: u32,
    /// In-process diagnostic counter of undecodable entries seen per queue.
    invalid_seen: DashMap<String, u64>,
}

impl DeadLetterQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_max_resurrections(store, DEFAULT_MAX_RESURRECTIONS)
    }

    pub fn with_max_resurrections(store: Arc<dyn Store>, max: u32) -> Self {
        Self {
            store,
            max_resurrections: max,
            invalid_seen: DashMap::new(),
        }
    }

    /// Append an item to the main list, its category sublist, the metadata
    /// hash, and (when retryable with a schedule) the retry sorted set.
    pub async fn add(&self, item: &DlqItem) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(item)?;
        let queue = &item.queue;

        self.store
            .list_push_head(&keys::dlq_main(queue), &encoded)
            .await?;
        self.store
            .list_push_head(&keys::dlq_category(queue, item.category.as_str()), &encoded)
            .await?;

        let meta = keys::dlq_meta(queue);
        self.store.hash_incr(&meta, "total", 1).await?;
        let bucket = if item.can_retry { "retryable" } else { "nonRetryable" };
        self.store.hash_incr(&meta, bucket, 1).await?;

        if item.can_retry {
            if let Some(at) = item.next_retry_at {
                self.store
                    .zset_add(
                        &keys::dlq_retry(queue),
                        &item.id,
                        at.timestamp_millis() as f64,
                    )
                    .await?;
            }
        }

        debug!(
            queue = %queue,
            job_id = %item.id,
            category = item.category.as_str(),
            can_retry = item.can_retry,
            "job dead-lettered"
        );
        Ok(())
    }

    /// List items newest first, optionally restricted to one category.
    /// Undecodable entries are skipped with a warning and counted.
    pub async fn list(
        &self,
        queue: &str,
        category: Option<ErrorCategory>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<DlqItem>, QueueError> {
        let key = match category {
            Some(cat) => keys::dlq_category(queue, cat.as_str()),
            None => keys::dlq_main(queue),
        };
        let stop = (offset + limit) as isize - 1;
        let raw = self.store.list_range(&key, offset as isize, stop).await?;

        let mut items = Vec::with_capacity(raw.len());
        for encoded in raw {
            match serde_json::from_str::<DlqItem>(&encoded) {
                Ok(item) => items.push(item),
                Err(e) => {
                    warn!(queue = %queue, error = %e, "skipping undecodable dead-letter entry");
                    *self.invalid_seen.entry(queue.to_string()).or_insert(0) += 1;
                }
            }
        }
        Ok(items)
    }

    /// Find one item (with its raw encoding, needed for list removal).
    async fn find_raw(
        &self,
        queue: &str,
        id: &str,
    ) -> Result<Option<(String, DlqItem)>, QueueError> {
        let raw = self
            .store
            .list_range(&keys::dlq_main(queue), 0, -1)
            .await?;
        for encoded in raw {
            match serde_json::from_str::<DlqItem>(&encoded) {
                Ok(item) if item.id == id => return Ok(Some((encoded, item))),
                Ok(_) => {}
                Err(e) => {
                    warn!(queue = %queue, error = %e, "skipping undecodable dead-letter entry");
                    *self.invalid_seen.entry(queue.to_string()).or_insert(0) += 1;
                }
            }
        }
        Ok(None)
    }

    /// Fetch one item by id.
    pub async fn item(&self, queue: &str, id: &str) -> Result<Option<DlqItem>, QueueError> {
        Ok(self.find_raw(queue, id).await?.map(|(_, item)| item))
    }

    /// Pull an item out of the dead-letter structures for re-enqueueing.
    ///
    /// Returns the item with its resurrection metadata advanced; the caller
    /// re-submits the payload to the origin queue. Bounded by the configured
    /// resurrection cap.
    pub async fn resurrect(&self, queue: &str, id: &str) -> Result<DlqItem, QueueError> {
        let (raw, mut item) = self
            .find_raw(queue, id)
            .await?
            .ok_or_else(|| QueueError::DlqItemNotFound(id.to_string()))?;

        if item.resurrection_count >= self.max_resurrections {
            return Err(QueueError::ResurrectionLimit(id.to_string()));
        }

        self.store.list_remove(&keys::dlq_main(queue), &raw).await?;
        self.store
            .list_remove(&keys::dlq_category(queue, item.category.as_str()), &raw)
            .await?;
        self.store.zset_remove(&keys::dlq_retry(queue), id).await?;

        let meta = keys::dlq_meta(queue);
        self.store.hash_incr(&meta, "total", -1).await?;
        let bucket = if item.can_retry { "retryable" } else { "nonRetryable" };
        self.store.hash_incr(&meta, bucket, -1).await?;

        let now = Utc::now();
        item.resurrection_count += 1;
        item.resurrection_history.push(now);
        item.next_retry_at = None;

        let record = RetriedRecord {
            success: true,
            retried_at: now,
        };
        self.store
            .hash_set(
                &keys::dlq_retried(queue),
                id,
                &serde_json::to_string(&record)?,
            )
            .await?;

        Ok(item)
    }

    /// Ids whose scheduled retry is due, capped per tick. Permanent items
    /// never enter the schedule, so this is a no-op for them.
    pub async fn due_retries(
        &self,
        queue: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, QueueError> {
        Ok(self
            .store
            .zset_range_by_score(
                &keys::dlq_retry(queue),
                f64::MIN,
                now.timestamp_millis() as f64,
                Some(RETRY_BATCH),
            )
            .await?)
    }

    /// Delete items that failed before `now - older_than_days`, optionally
    /// only in one category. Returns how many were removed.
    pub async fn purge(
        &self,
        queue: &str,
        older_than_days: i64,
        category: Option<ErrorCategory>,
    ) -> Result<usize, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::days(older_than_days);
        let raw = self
            .store
            .list_range(&keys::dlq_main(queue), 0, -1)
            .await?;

        let mut removed = 0;
        for encoded in raw {
            let Ok(item) = serde_json::from_str::<DlqItem>(&encoded) else {
                continue;
            };
            if item.failed_at >= cutoff {
                continue;
            }
            if let Some(cat) = category {
                if item.category != cat {
                    continue;
                }
            }

            self.store.list_remove(&keys::dlq_main(queue), &encoded).await?;
            self.store
                .list_remove(&keys::dlq_category(queue, item.category.as_str()), &encoded)
                .await?;
            self.store
                .zset_remove(&keys::dlq_retry(queue), &item.id)
                .await?;

            let meta = keys::dlq_meta(queue);
            self.store.hash_incr(&meta, "total", -1).await?;
            let bucket = if item.can_retry { "retryable" } else { "nonRetryable" };
            self.store.hash_incr(&meta, bucket, -1).await?;
            removed += 1;
        }
        Ok(removed)
    }

    /// Drop an id from the retry schedule without touching the item.
    pub async fn unschedule(&self, queue: &str, id: &str) -> Result<(), QueueError> {
        self.store.zset_remove(&keys::dlq_retry(queue), id).await?;
        Ok(())
    }

    /// Current size of the main list.
    pub async fn size(&self, queue: &str) -> Result<u64, QueueError> {
        Ok(self.store.list_len(&keys::dlq_main(queue)).await?)
    }

    /// Counters for one queue.
    pub async fn stats(&self, queue: &str) -> Result<DlqStats, QueueError> {
        let meta = self.store.hash_get_all(&keys::dlq_meta(queue)).await?;
        let counter = |name: &str| -> u64 {
            meta.get(name)
                .and_then(|v| v.parse::<i64>().ok())
                .map(|v| v.max(0) as u64)
                .unwrap_or(0)
        };

        let mut by_category = std::collections::HashMap::new();
        for cat in ErrorCategory::ALL {
            let len = self
                .store
                .list_len(&keys::dlq_category(queue, cat.as_str()))
                .await?;
            if len > 0 {
                by_category.insert(cat.as_str().to_string(), len);
            }
        }

        Ok(DlqStats {
            total: counter("total"),
            retryable: counter("retryable"),
            non_retryable: counter("nonRetryable"),
            scheduled_retries: self.store.zset_card(&keys::dlq_retry(queue)).await?,
            invalid_entries: self
                .invalid_seen
                .get(queue)
                .map(|v| *v)
                .unwrap_or(0),
            by_category,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn dlq() -> (DeadLetterQueue, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        (DeadLetterQueue::new(store.clone()), store)
    }

    fn item(queue: &str, category: ErrorCategory, can_retry: bool) -> DlqItem {
        let job = Job::builder()
            .queue(queue)
            .kind("news-index")
            .payload(json!({ "article": 7 }))
            .build();
        DlqItem::from_job(
            &job,
            "boom",
            category,
            can_retry,
            can_retry.then(|| Utc::now() + chrono::Duration::minutes(10)),
        )
    }

    #[tokio::test]
    async fn add_updates_lists_meta_and_schedule() {
        let (dlq, _) = dlq();
        let it = item("q", ErrorCategory::NetworkError, true);
        dlq.add(&it).await.unwrap();

        let stats = dlq.stats("q").await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.retryable, 1);
        assert_eq!(stats.non_retryable, 0);
        assert_eq!(stats.scheduled_retries, 1);
        assert_eq!(stats.by_category.get("network-error"), Some(&1));
    }

    #[tokio::test]
    async fn permanent_items_schedule_nothing() {
        let (dlq, _) = dlq();
        let it = item("q", ErrorCategory::ValidationError, false);
        assert!(it.next_retry_at.is_none());
        dlq.add(&it).await.unwrap();

        let stats = dlq.stats("q").await.unwrap();
        assert_eq!(stats.non_retryable, 1);
        assert_eq!(stats.scheduled_retries, 0);
        assert!(dlq.due_retries("q", Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn list_is_newest_first_and_filters_by_category() {
        let (dlq, _) = dlq();
        let older = item("q", ErrorCategory::NetworkError, true);
        let newer = item("q", ErrorCategory::TimeoutError, true);
        dlq.add(&older).await.unwrap();
        dlq.add(&newer).await.unwrap();

        let all = dlq.list("q", None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, newer.id);

        let timeouts = dlq
            .list("q", Some(ErrorCategory::TimeoutError), 10, 0)
            .await
            .unwrap();
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].id, newer.id);
    }

    #[tokio::test]
    async fn undecodable_entries_are_skipped_and_counted() {
        let (dlq, store) = dlq();
        let it = item("q", ErrorCategory::NetworkError, true);
        dlq.add(&it).await.unwrap();
        store
            .list_push_head(&keys::dlq_main("q"), "{not json")
            .await
            .unwrap();

        let items = dlq.list("q", None, 10, 0).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(dlq.stats("q").await.unwrap().invalid_entries, 1);
    }

    #[tokio::test]
    async fn resurrect_removes_everywhere_and_advances_metadata() {
        let (dlq, _) = dlq();
        let it = item("q", ErrorCategory::NetworkError, true);
        dlq.add(&it).await.unwrap();

        let resurrected = dlq.resurrect("q", &it.id).await.unwrap();
        assert_eq!(resurrected.resurrection_count, 1);
        assert_eq!(resurrected.resurrection_history.len(), 1);

        let stats = dlq.stats("q").await.unwrap();
        assert_eq!(stats.total, 0);
        assert_eq!(stats.scheduled_retries, 0);
        assert!(dlq.list("q", None, 10, 0).await.unwrap().is_empty());

        // Re-running a bulk pass after full success is a no-op
        let err = dlq.resurrect("q", &it.id).await.unwrap_err();
        assert!(matches!(err, QueueError::DlqItemNotFound(_)));
    }

    #[tokio::test]
    async fn resurrection_cap_is_enforced() {
        let store = Arc::new(MemoryStore::new());
        let dlq = DeadLetterQueue::with_max_resurrections(store, 1);
        let mut it = item("q", ErrorCategory::NetworkError, true);
        it.resurrection_count = 1;
        dlq.add(&it).await.unwrap();

        let err = dlq.resurrect("q", &it.id).await.unwrap_err();
        assert!(matches!(err, QueueError::ResurrectionLimit(_)));
    }

    #[tokio::test]
    async fn due_retries_only_returns_elapsed_schedules() {
        let (dlq, _) = dlq();
        let mut due = item("q", ErrorCategory::NetworkError, true);
        due.next_retry_at = Some(Utc::now() - chrono::Duration::minutes(1));
        let mut not_due = item("q", ErrorCategory::TimeoutError, true);
        not_due.next_retry_at = Some(Utc::now() + chrono::Duration::minutes(30));
        dlq.add(&due).await.unwrap();
        dlq.add(&not_due).await.unwrap();

        let ids = dlq.due_retries("q", Utc::now()).await.unwrap();
        assert_eq!(ids, vec![due.id.clone()]);
    }

    #[tokio::test]
    async fn purge_by_age_and_category() {
        let (dlq, _) = dlq();
        let mut old_net = item("q", ErrorCategory::NetworkError, true);
        old_net.failed_at = Utc::now() - chrono::Duration::days(40);
        let mut old_val = item("q", ErrorCategory::ValidationError, false);
        old_val.failed_at = Utc::now() - chrono::Duration::days(40);
        let fresh = item("q", ErrorCategory::NetworkError, true);
        dlq.add(&old_net).await.unwrap();
        dlq.add(&old_val).await.unwrap();
        dlq.add(&fresh).await.unwrap();

        let removed = dlq
            .purge("q", 30, Some(ErrorCategory::ValidationError))
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(dlq.stats("q").await.unwrap().total, 2);

        let removed = dlq.purge("q", 30, None).await.unwrap();
        assert_eq!(removed, 1);
        let stats = dlq.stats("q").await.unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(dlq.size("q").await.unwrap(), 1);
    }
}
