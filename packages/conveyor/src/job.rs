//! Job model for durable background execution.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::retry::Backoff;

// ============================================================================
// Enums
// ============================================================================

/// Where a job sits in its lifecycle.
///
/// Transitions are monotonic through the list below, with one exception:
/// a failed job returns to `Waiting` once its retry backoff elapses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Ready to be picked up by a worker.
    #[default]
    Waiting,
    /// Enqueued with a delay that has not elapsed yet.
    Delayed,
    /// Currently executing on a worker.
    Active,
    /// Finished successfully.
    Completed,
    /// Failed, waiting out its retry backoff.
    Failed,
    /// Terminally failed and moved to the dead-letter queue.
    Dead,
}

impl JobState {
    /// Whether the job will never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Dead)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

// ============================================================================
// Job
// ============================================================================

/// A unit of durable background work.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    // Identity
    pub queue: String,
    pub kind: String,

    // Payload
    #[builder(default = serde_json::Value::Null)]
    pub payload: serde_json::Value,

    // Prioritisation
    /// Priority weight; higher runs sooner.
    #[builder(default = 5)]
    pub priority: i32,
    #[builder(default)]
    pub tags: Vec<String>,
    #[builder(default, setter(strip_option))]
    pub parent_id: Option<String>,
    /// Submitter metadata; `metadata.priority` overrides the resolver.
    #[builder(default = serde_json::Value::Null)]
    pub metadata: serde_json::Value,

    // Retry policy
    #[builder(default = 3)]
    pub max_attempts: u32,
    #[builder(default = 0)]
    pub attempts_made: u32,
    #[builder(default)]
    pub backoff: Backoff,

    // Execution settings
    #[builder(default, setter(strip_option))]
    pub timeout_ms: Option<u64>,

    // State
    #[builder(default)]
    pub state: JobState,
    #[builder(default, setter(strip_option))]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub last_error: Option<String>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default, setter(strip_option))]
    pub started_at: Option<DateTime<Utc>>,
    #[builder(default, setter(strip_option))]
    pub finished_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Whether the job may run right now.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        if !matches!(self.state, JobState::Waiting) {
            return false;
        }
        match self.scheduled_at {
            None => true,
            Some(at) => at <= now,
        }
    }

    /// Whether another retry is allowed after a failure.
    pub fn retries_remaining(&self) -> bool {
        self.attempts_made < self.max_attempts
    }

    /// The instant this job becomes (or became) eligible to run, in epoch ms.
    pub fn ready_at_ms(&self) -> i64 {
        self.scheduled_at
            .unwrap_or(self.created_at)
            .timestamp_millis()
    }
}

/// Score for the ready sorted set: strict priority bands, FIFO inside a band.
///
/// Higher-priority jobs land in lower bands so `ZPOPMIN` pops them first;
/// within a band the epoch-ms term preserves enqueue order. Both terms stay
/// well inside f64's 2^53 integer range.
pub fn wait_score(priority: i32, ready_at_ms: i64) -> f64 {
    let band = (100 - priority.clamp(0, 100)) as f64;
    band * 1e13 + ready_at_ms as f64
}

// ============================================================================
// Submit options
// ============================================================================

/// Options accepted at enqueue time.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobOptions {
    /// Maximum attempts; defaults to the queue-wide setting (3).
    pub attempts: Option<u32>,
    /// Backoff between retries; defaults to exponential(2 s, ×2, cap 5 min).
    pub backoff: Option<Backoff>,
    /// Explicit priority weight; bypasses the resolver when set.
    pub priority: Option<i32>,
    /// Delay before the job becomes ready.
    pub delay_ms: Option<u64>,
    /// Processor deadline override.
    pub timeout_ms: Option<u64>,
    /// Tags consumed by the priority resolver.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Parent job id, for priority inheritance.
    pub parent_id: Option<String>,
}

/// Lifetime counters for a queue, alongside current per-state sizes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
    /// Total jobs ever enqueued.
    pub enqueued_total: u64,
}

impl JobCounts {
    /// Jobs waiting for a worker (ready or delayed).
    pub fn backlog(&self) -> u64 {
        self.waiting + self.delayed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder().queue("tts").kind("tts").build()
    }

    #[test]
    fn new_job_defaults() {
        let job = sample_job();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(job.priority, 5);
    }

    #[test]
    fn ready_without_schedule() {
        let job = sample_job();
        assert!(job.is_ready(Utc::now()));
    }

    #[test]
    fn not_ready_before_scheduled_at() {
        let mut job = sample_job();
        job.scheduled_at = Some(Utc::now() + chrono::Duration::minutes(5));
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn active_job_is_not_ready() {
        let mut job = sample_job();
        job.state = JobState::Active;
        assert!(!job.is_ready(Utc::now()));
    }

    #[test]
    fn terminal_states() {
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Dead.is_terminal());
        assert!(!JobState::Failed.is_terminal());
        assert!(!JobState::Waiting.is_terminal());
    }

    #[test]
    fn wait_score_orders_priority_before_time() {
        let now = Utc::now().timestamp_millis();
        let critical = wait_score(20, now + 60_000);
        let low_but_older = wait_score(1, now);
        assert!(critical < low_but_older, "higher priority pops first");
    }

    #[test]
    fn wait_score_is_fifo_within_a_priority() {
        let now = Utc::now().timestamp_millis();
        let first = wait_score(5, now);
        let second = wait_score(5, now + 1);
        assert!(first < second);
    }

    #[test]
    fn job_serializes_round_trip() {
        let job = sample_job();
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.state, JobState::Waiting);
    }
}
