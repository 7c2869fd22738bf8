//! Scheduled job submissions: delayed, recurring, dependency-linked,
//! chained, and conditional.
//!
//! The registry is a store hash (id → record) so schedules survive restart.
//! A driver tick runs once a minute: for every active record whose
//! `next_run` has arrived, it gates on dependencies and conditions, submits
//! the job, fires any chained submissions, and recomputes `next_run`.
//!
//! Cron expressions go through a real parser; five-field crontab strings
//! are accepted by prefixing a seconds column.

use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::job::{Job, JobState};
use crate::log::JobLog;
use crate::priority::{PriorityContext, PriorityResolver};
use crate::store::{keys, Store};

/// Per-tick cap on fired records, to avoid thundering herds.
const TICK_BATCH: usize = 100;

// ============================================================================
// Records
// ============================================================================

/// When a scheduled job runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Schedule {
    /// Run once after a delay from creation.
    Delay { delay_ms: u64 },
    /// Run on a fixed interval.
    Every { every_ms: u64 },
    /// Run on a cron expression (5- or 6-field).
    Cron { expr: String },
}

fn default_true() -> bool {
    true
}

/// A registered recurring or deferred submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: String,
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub schedule: Schedule,
    /// Explicit priority; resolved from the payload when absent.
    pub priority: Option<i32>,
    /// Ids of scheduled jobs that must have completed a run first.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Name of a registered predicate gating each run.
    pub condition: Option<String>,
    pub max_runs: Option<u32>,
    #[serde(default)]
    pub run_count: u32,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
    /// The job submitted by the most recent run.
    pub last_job_id: Option<Uuid>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl ScheduledJob {
    pub fn new(
        id: impl Into<String>,
        queue: impl Into<String>,
        kind: impl Into<String>,
        payload: serde_json::Value,
        schedule: Schedule,
    ) -> Self {
        Self {
            id: id.into(),
            queue: queue.into(),
            kind: kind.into(),
            payload,
            schedule,
            priority: None,
            depends_on: Vec::new(),
            condition: None,
            max_runs: None,
            run_count: 0,
            last_run: None,
            next_run: None,
            last_job_id: None,
            active: true,
            created_at: Utc::now(),
        }
    }
}

/// A submission fired right after its parent scheduled job runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainedSpec {
    pub queue: String,
    pub kind: String,
    pub payload: serde_json::Value,
    pub priority: Option<i32>,
}

/// Predicate gating a scheduled run.
pub type ConditionFn = Arc<dyn Fn(&ScheduledJob) -> bool + Send + Sync>;

// ============================================================================
// Cron handling
// ============================================================================

/// Parse a cron expression, accepting classic five-field crontab strings by
/// prefixing a seconds column.
fn parse_cron(expr: &str) -> Result<cron::Schedule, QueueError> {
    let fields = expr.split_whitespace().count();
    let normalized = if fields == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    cron::Schedule::from_str(&normalized)
        .map_err(|e| QueueError::InvalidCron(format!("{expr}: {e}")))
}

/// The next run time for a schedule, from `now`.
pub fn next_run_after(
    schedule: &Schedule,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, QueueError> {
    match schedule {
        Schedule::Delay { delay_ms } => {
            Ok(Some(now + chrono::Duration::milliseconds(*delay_ms as i64)))
        }
        Schedule::Every { every_ms } => {
            Ok(Some(now + chrono::Duration::milliseconds(*every_ms as i64)))
        }
        Schedule::Cron { expr } => Ok(parse_cron(expr)?.after(&now).next()),
    }
}

// ============================================================================
// Scheduler
// ============================================================================

/// Registry plus driver for scheduled submissions.
pub struct JobScheduler {
    store: Arc<dyn Store>,
    log: Arc<JobLog>,
    resolver: Arc<PriorityResolver>,
    conditions: DashMap<String, ConditionFn>,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn Store>, log: Arc<JobLog>, resolver: Arc<PriorityResolver>) -> Self {
        Self {
            store,
            log,
            resolver,
            conditions: DashMap::new(),
        }
    }

    /// Register a named condition predicate.
    pub fn register_condition(&self, name: impl Into<String>, f: ConditionFn) {
        self.conditions.insert(name.into(), f);
    }

    /// Register a schedule. Validates cron expressions and computes the
    /// first `next_run` when the caller left it unset.
    pub async fn schedule(&self, mut record: ScheduledJob) -> Result<ScheduledJob, QueueError> {
        if let Schedule::Cron { expr } = &record.schedule {
            parse_cron(expr)?;
        }
        if record.next_run.is_none() {
            record.next_run = next_run_after(&record.schedule, Utc::now())?;
        }
        self.persist(&record).await?;
        info!(id = %record.id, queue = %record.queue, kind = %record.kind, "schedule registered");
        Ok(record)
    }

    /// Register a chained submission fired after `parent_id` runs.
    pub async fn chain(&self, parent_id: &str, spec: ChainedSpec) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(&spec)?;
        self.store
            .list_push_tail(&keys::chained_jobs(parent_id), &encoded)
            .await?;
        Ok(())
    }

    /// Deactivate a schedule, keeping the record for inspection.
    pub async fn cancel(&self, id: &str) -> Result<(), QueueError> {
        let mut record = self
            .get(id)
            .await?
            .ok_or_else(|| QueueError::ScheduleNotFound(id.to_string()))?;
        record.active = false;
        self.persist(&record).await
    }

    /// Delete a schedule and its chained submissions.
    pub async fn remove(&self, id: &str) -> Result<(), QueueError> {
        self.store
            .hash_del(&keys::scheduled_jobs(), id)
            .await?;
        self.store.del(&keys::chained_jobs(id)).await?;
        Ok(())
    }

    /// Overwrite a schedule record.
    pub async fn update(&self, record: &ScheduledJob) -> Result<(), QueueError> {
        if self.get(&record.id).await?.is_none() {
            return Err(QueueError::ScheduleNotFound(record.id.clone()));
        }
        self.persist(record).await
    }

    /// Run a schedule immediately, bypassing its timer (but not its
    /// dependency or condition gates).
    pub async fn trigger(&self, id: &str) -> Result<bool, QueueError> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| QueueError::ScheduleNotFound(id.to_string()))?;
        self.try_fire(record, Utc::now()).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<ScheduledJob>, QueueError> {
        let raw = self.store.hash_get(&keys::scheduled_jobs(), id).await?;
        match raw {
            Some(encoded) => Ok(Some(serde_json::from_str(&encoded)?)),
            None => Ok(None),
        }
    }

    /// All registered schedules.
    pub async fn list(&self) -> Result<Vec<ScheduledJob>, QueueError> {
        let raw = self.store.hash_get_all(&keys::scheduled_jobs()).await?;
        let mut records = Vec::with_capacity(raw.len());
        for (id, encoded) in raw {
            match serde_json::from_str(&encoded) {
                Ok(record) => records.push(record),
                Err(e) => warn!(id = %id, error = %e, "skipping undecodable schedule record"),
            }
        }
        Ok(records)
    }

    /// One driver pass: fire every active, due record (capped per tick).
    /// Returns how many records actually submitted a job.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<usize, QueueError> {
        let mut due: Vec<ScheduledJob> = self
            .list()
            .await?
            .into_iter()
            .filter(|r| r.active && r.next_run.map(|at| at <= now).unwrap_or(false))
            .collect();
        due.sort_by_key(|r| r.next_run);
        due.truncate(TICK_BATCH);

        let mut fired = 0;
        for record in due {
            if self.try_fire(record, now).await? {
                fired += 1;
            }
        }
        Ok(fired)
    }

    /// Gate one record through dependencies, condition, and run budget;
    /// submit when clear. Returns whether a job was submitted.
    async fn try_fire(&self, mut record: ScheduledJob, now: DateTime<Utc>) -> Result<bool, QueueError> {
        // Dependencies: every listed id must name a known schedule whose
        // most recent job completed. A missing dependency blocks.
        for dep_id in &record.depends_on {
            let Some(dep) = self.get(dep_id).await? else {
                debug!(id = %record.id, dep = %dep_id, "blocked on missing dependency");
                return Ok(false);
            };
            let satisfied = match dep.last_job_id {
                None => false,
                Some(job_id) => self
                    .log
                    .job(&dep.queue, job_id)
                    .await?
                    .map(|j| j.state == JobState::Completed)
                    .unwrap_or(false),
            };
            if !satisfied {
                debug!(id = %record.id, dep = %dep_id, "blocked on incomplete dependency");
                return Ok(false);
            }
        }

        // Condition: unknown predicate names skip with a warning; a false
        // predicate skips this tick without consuming the run budget.
        if let Some(name) = &record.condition {
            match self.conditions.get(name) {
                Some(predicate) => {
                    if !predicate(&record) {
                        debug!(id = %record.id, condition = %name, "condition false, skipping tick");
                        return Ok(false);
                    }
                }
                None => {
                    warn!(id = %record.id, condition = %name, "unknown condition, skipping tick");
                    return Ok(false);
                }
            }
        }

        // Run budget.
        if let Some(max) = record.max_runs {
            if record.run_count >= max {
                record.active = false;
                self.persist(&record).await?;
                info!(id = %record.id, runs = record.run_count, "schedule exhausted, deactivated");
                return Ok(false);
            }
        }

        // Submit.
        let priority = match record.priority {
            Some(p) => p,
            None => self.resolver.resolve(&PriorityContext {
                kind: &record.kind,
                payload: &record.payload,
                metadata: &serde_json::Value::Null,
                tags: &[],
                parent_id: None,
                enqueued_at: now,
            }),
        };
        let job = Job::builder()
            .queue(record.queue.clone())
            .kind(record.kind.clone())
            .payload(record.payload.clone())
            .priority(priority)
            .build();
        let job = self.log.enqueue(job).await?;
        debug!(id = %record.id, job_id = %job.id, "scheduled job submitted");

        // Chained submissions fire with the parent.
        let chained = self
            .store
            .list_range(&keys::chained_jobs(&record.id), 0, -1)
            .await?;
        for encoded in chained {
            match serde_json::from_str::<ChainedSpec>(&encoded) {
                Ok(spec) => {
                    let chained_job = Job::builder()
                        .queue(spec.queue)
                        .kind(spec.kind)
                        .payload(spec.payload)
                        .priority(spec.priority.unwrap_or(5))
                        .parent_id(record.id.clone())
                        .build();
                    self.log.enqueue(chained_job).await?;
                }
                Err(e) => warn!(id = %record.id, error = %e, "skipping undecodable chained spec"),
            }
        }

        // Advance the record.
        record.run_count += 1;
        record.last_run = Some(now);
        record.last_job_id = Some(job.id);
        record.next_run = match &record.schedule {
            Schedule::Delay { .. } => None,
            other => next_run_after(other, now)?,
        };
        if record.next_run.is_none() {
            record.active = false;
        }
        if let Some(max) = record.max_runs {
            if record.run_count >= max {
                record.active = false;
            }
        }
        self.persist(&record).await?;
        Ok(true)
    }

    async fn persist(&self, record: &ScheduledJob) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(record)?;
        self.store
            .hash_set(&keys::scheduled_jobs(), &record.id, &encoded)
            .await?;
        Ok(())
    }
}
