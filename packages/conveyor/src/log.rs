//! Durable per-queue job log.
//!
//! Every job record lives in a per-queue hash; membership in the waiting /
//! delayed / active / completed / failed structures tracks its state. The
//! log survives restart: a worker that crashes mid-poll finds the same
//! ready set when it comes back.
//!
//! # Ordering
//!
//! The ready set is a sorted set scored by [`wait_score`]: strict priority
//! bands (higher priority pops first), FIFO by enqueue time within a band.
//! No ordering is promised across queues.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::job::{wait_score, Job, JobCounts, JobState};
use crate::store::{keys, Store};

/// How many completed / dead ids each bookkeeping list keeps.
const LIST_RETENTION: isize = 10_000;

/// Delayed-promotion batch cap per poll, to avoid thundering herds.
const PROMOTE_BATCH: usize = 100;

/// Durable job log over the KV store.
pub struct JobLog {
    store: Arc<dyn Store>,
    bus: EventBus,
}

impl JobLog {
    pub fn new(store: Arc<dyn Store>, bus: EventBus) -> Self {
        Self { store, bus }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Persist the job record without touching queue membership.
    pub async fn save(&self, job: &Job) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(job)?;
        self.store
            .hash_set(&keys::jobs(&job.queue), &job.id.to_string(), &encoded)
            .await?;
        Ok(())
    }

    /// Accept a job into the log. Delayed jobs land in the delayed set,
    /// everything else goes straight to the ready set.
    pub async fn enqueue(&self, mut job: Job) -> Result<Job, QueueError> {
        let now = Utc::now();
        let delayed = job
            .scheduled_at
            .map(|at| at > now)
            .unwrap_or(false);
        job.state = if delayed { JobState::Delayed } else { JobState::Waiting };

        self.save(&job).await?;
        let id = job.id.to_string();
        if delayed {
            self.store
                .zset_add(
                    &keys::delayed(&job.queue),
                    &id,
                    job.ready_at_ms() as f64,
                )
                .await?;
        } else {
            self.store
                .zset_add(
                    &keys::wait(&job.queue),
                    &id,
                    wait_score(job.priority, now.timestamp_millis()),
                )
                .await?;
        }
        self.store
            .hash_incr(&keys::counts(&job.queue), "enqueued_total", 1)
            .await?;

        self.bus.emit(QueueEvent::Enqueued {
            queue: job.queue.clone(),
            job_id: job.id,
            kind: job.kind.clone(),
            priority: job.priority,
        });
        debug!(queue = %job.queue, job_id = %job.id, kind = %job.kind, "job enqueued");
        Ok(job)
    }

    /// Load a job record.
    pub async fn job(&self, queue: &str, id: Uuid) -> Result<Option<Job>, QueueError> {
        let raw = self
            .store
            .hash_get(&keys::jobs(queue), &id.to_string())
            .await?;
        match raw {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    /// Move due delayed jobs (including failed jobs whose backoff elapsed)
    /// into the ready set. Returns how many were promoted.
    pub async fn promote_due(&self, queue: &str) -> Result<usize, QueueError> {
        let now_ms = Utc::now().timestamp_millis() as f64;
        let due = self
            .store
            .zset_range_by_score(&keys::delayed(queue), f64::MIN, now_ms, Some(PROMOTE_BATCH))
            .await?;

        let mut promoted = 0;
        for id in due {
            if !self.store.zset_remove(&keys::delayed(queue), &id).await? {
                continue; // another poller got it first
            }
            let Ok(uuid) = Uuid::parse_str(&id) else {
                warn!(queue = %queue, id = %id, "dropping malformed id from delayed set");
                continue;
            };
            let Some(mut job) = self.job(queue, uuid).await? else {
                warn!(queue = %queue, id = %id, "delayed entry has no job record");
                continue;
            };
            job.state = JobState::Waiting;
            self.save(&job).await?;
            self.store
                .zset_add(
                    &keys::wait(queue),
                    &id,
                    wait_score(job.priority, job.ready_at_ms()),
                )
                .await?;
            promoted += 1;
        }
        Ok(promoted)
    }

    /// Pop the highest-priority ready job and mark it active.
    pub async fn next_ready(&self, queue: &str) -> Result<Option<Job>, QueueError> {
        self.promote_due(queue).await?;

        loop {
            let popped = self.store.zset_pop_min(&keys::wait(queue), 1).await?;
            let Some((id, _)) = popped.into_iter().next() else {
                return Ok(None);
            };
            let Ok(uuid) = Uuid::parse_str(&id) else {
                warn!(queue = %queue, id = %id, "dropping malformed id from ready set");
                continue;
            };
            let Some(mut job) = self.job(queue, uuid).await? else {
                warn!(queue = %queue, id = %id, "ready entry has no job record");
                continue;
            };

            job.state = JobState::Active;
            job.attempts_made += 1;
            job.started_at = Some(Utc::now());
            self.save(&job).await?;
            self.store.list_push_head(&keys::active(queue), &id).await?;
            return Ok(Some(job));
        }
    }

    /// Pop the next ready job, polling until `timeout` elapses.
    pub async fn next_ready_blocking(
        &self,
        queue: &str,
        timeout: Duration,
    ) -> Result<Option<Job>, QueueError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(job) = self.next_ready(queue).await? {
                return Ok(Some(job));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Mark an active job completed.
    pub async fn mark_completed(&self, job: &mut Job) -> Result<(), QueueError> {
        let id = job.id.to_string();
        job.state = JobState::Completed;
        job.finished_at = Some(Utc::now());
        job.last_error = None;
        self.save(job).await?;

        self.store.list_remove(&keys::active(&job.queue), &id).await?;
        self.store
            .list_push_head(&keys::completed(&job.queue), &id)
            .await?;
        self.store
            .list_trim(&keys::completed(&job.queue), 0, LIST_RETENTION - 1)
            .await?;
        self.store
            .hash_incr(&keys::counts(&job.queue), "completed_total", 1)
            .await?;
        Ok(())
    }

    /// Park a failed job until its retry backoff elapses.
    pub async fn mark_retry(
        &self,
        job: &mut Job,
        error: &str,
        ready_at: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        let id = job.id.to_string();
        job.state = JobState::Failed;
        job.last_error = Some(error.to_string());
        job.scheduled_at = Some(ready_at);
        self.save(job).await?;

        self.store.list_remove(&keys::active(&job.queue), &id).await?;
        self.store
            .zset_add(
                &keys::delayed(&job.queue),
                &id,
                ready_at.timestamp_millis() as f64,
            )
            .await?;
        self.store
            .hash_incr(&keys::counts(&job.queue), "failed_total", 1)
            .await?;
        Ok(())
    }

    /// Mark a job terminally failed. The caller owns the dead-letter entry.
    pub async fn mark_dead(&self, job: &mut Job, error: &str) -> Result<(), QueueError> {
        let id = job.id.to_string();
        job.state = JobState::Dead;
        job.last_error = Some(error.to_string());
        job.finished_at = Some(Utc::now());
        self.save(job).await?;

        self.store.list_remove(&keys::active(&job.queue), &id).await?;
        // Terminal failures can also arrive from the waiting/delayed sets
        // (breaker rejections, cancelled retries).
        self.store.zset_remove(&keys::wait(&job.queue), &id).await?;
        self.store.zset_remove(&keys::delayed(&job.queue), &id).await?;
        self.store
            .list_push_head(&keys::failed(&job.queue), &id)
            .await?;
        self.store
            .list_trim(&keys::failed(&job.queue), 0, LIST_RETENTION - 1)
            .await?;
        self.store
            .hash_incr(&keys::counts(&job.queue), "failed_total", 1)
            .await?;
        self.store
            .hash_incr(&keys::counts(&job.queue), "dead_total", 1)
            .await?;
        Ok(())
    }

    /// Put a job (typically failed or dead) back on the ready set with a
    /// fresh attempt budget.
    pub async fn requeue(&self, queue: &str, id: Uuid) -> Result<Job, QueueError> {
        let mut job = self
            .job(queue, id)
            .await?
            .ok_or(QueueError::JobNotFound(id))?;

        let id_str = id.to_string();
        self.store.list_remove(&keys::active(queue), &id_str).await?;
        self.store.list_remove(&keys::completed(queue), &id_str).await?;
        self.store.list_remove(&keys::failed(queue), &id_str).await?;
        self.store.zset_remove(&keys::delayed(queue), &id_str).await?;

        job.state = JobState::Waiting;
        job.attempts_made = 0;
        job.scheduled_at = None;
        job.started_at = None;
        job.finished_at = None;
        self.save(&job).await?;
        self.store
            .zset_add(
                &keys::wait(queue),
                &id_str,
                wait_score(job.priority, Utc::now().timestamp_millis()),
            )
            .await?;
        Ok(job)
    }

    /// Remove a job from the log entirely. Emits `Cancelled` when the job
    /// had not yet run to completion.
    pub async fn remove(&self, queue: &str, id: Uuid) -> Result<(), QueueError> {
        let job = self
            .job(queue, id)
            .await?
            .ok_or(QueueError::JobNotFound(id))?;

        let id_str = id.to_string();
        self.store.zset_remove(&keys::wait(queue), &id_str).await?;
        self.store.zset_remove(&keys::delayed(queue), &id_str).await?;
        self.store.list_remove(&keys::active(queue), &id_str).await?;
        self.store.list_remove(&keys::completed(queue), &id_str).await?;
        self.store.list_remove(&keys::failed(queue), &id_str).await?;
        self.store.hash_del(&keys::jobs(queue), &id_str).await?;

        if !job.state.is_terminal() {
            self.bus.emit(QueueEvent::Cancelled {
                queue: queue.to_string(),
                job_id: id,
            });
        }
        Ok(())
    }

    /// List jobs in a given state, newest first for list-backed states.
    pub async fn jobs_by_state(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, QueueError> {
        let ids: Vec<String> = match state {
            JobState::Waiting => {
                self.store
                    .zset_range_by_score(&keys::wait(queue), f64::MIN, f64::MAX, None)
                    .await?
            }
            JobState::Delayed | JobState::Failed => {
                self.store
                    .zset_range_by_score(&keys::delayed(queue), f64::MIN, f64::MAX, None)
                    .await?
            }
            JobState::Active => self.store.list_range(&keys::active(queue), 0, -1).await?,
            JobState::Completed => {
                self.store.list_range(&keys::completed(queue), 0, -1).await?
            }
            JobState::Dead => self.store.list_range(&keys::failed(queue), 0, -1).await?,
        };

        let mut jobs = Vec::new();
        for id in ids {
            let Ok(uuid) = Uuid::parse_str(&id) else { continue };
            if let Some(job) = self.job(queue, uuid).await? {
                // The delayed set mixes first-run delays with retry backoffs;
                // filter to the requested state.
                if job.state == state {
                    jobs.push(job);
                }
            }
        }
        Ok(jobs.into_iter().skip(offset).take(limit).collect())
    }

    /// Current sizes plus lifetime counters for a queue.
    pub async fn counts(&self, queue: &str) -> Result<JobCounts, QueueError> {
        let counters = self.store.hash_get_all(&keys::counts(queue)).await?;
        let counter = |name: &str| -> u64 {
            counters
                .get(name)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0)
        };

        Ok(JobCounts {
            waiting: self.store.zset_card(&keys::wait(queue)).await?,
            delayed: self.store.zset_card(&keys::delayed(queue)).await?,
            active: self.store.list_len(&keys::active(queue)).await?,
            completed: counter("completed_total"),
            failed: counter("failed_total"),
            dead: counter("dead_total"),
            enqueued_total: counter("enqueued_total"),
        })
    }

    /// Drop completed job records older than `cutoff`. Returns how many
    /// were removed.
    pub async fn purge_completed_before(
        &self,
        queue: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, QueueError> {
        let ids = self.store.list_range(&keys::completed(queue), 0, -1).await?;
        let mut removed = 0;
        for id in ids {
            let Ok(uuid) = Uuid::parse_str(&id) else { continue };
            let Some(job) = self.job(queue, uuid).await? else {
                self.store.list_remove(&keys::completed(queue), &id).await?;
                continue;
            };
            if job.finished_at.map(|at| at < cutoff).unwrap_or(false) {
                self.store.list_remove(&keys::completed(queue), &id).await?;
                self.store.hash_del(&keys::jobs(queue), &id).await?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Drop every structure belonging to a queue.
    pub async fn purge(&self, queue: &str) -> Result<(), QueueError> {
        for key in [
            keys::jobs(queue),
            keys::wait(queue),
            keys::delayed(queue),
            keys::active(queue),
            keys::completed(queue),
            keys::failed(queue),
            keys::counts(queue),
        ] {
            self.store.del(&key).await?;
        }
        Ok(())
    }
}
