//! # Conveyor
//!
//! A durable job queue with per-queue workers, retries with pluggable
//! backoff, priority scheduling, a categorized dead-letter queue with
//! scheduled resurrection, live metrics with alerting and trends, health
//! scoring with scaling advice, and a cron-capable scheduler.
//!
//! ## Architecture
//!
//! ```text
//! Submitter ──► QueueManager.enqueue()
//!                   │  (PriorityResolver tags the job)
//!                   ▼
//!               JobLog (store-backed: waiting / delayed / active / …)
//!                   │
//!                   ▼ next_ready()            priority DESC, FIFO within
//!               WorkerPool ──► Processor.execute() with deadline
//!                   │
//!        success ◄──┴──► failure
//!           │              │ classify → retry (backoff) │ circuit breaker
//!           ▼              ▼
//!       completed      DeadLetterQueue (categorized, scheduled retries)
//!
//!               EventBus (Enqueued/Started/Completed/Failed/…)
//!                   │
//!                   ▼
//!               QueueMonitor ──► samples, alerts, trends, predictions
//!                   │
//!                   ▼
//!               HealthMonitor ──► scores, scaling advice
//! ```
//!
//! Everything durable flows through the [`store::Store`] trait: a
//! Redis-shaped interface with a real Redis backend and an embedded
//! in-memory equivalent. All coordination state lives in the store; the
//! in-process maps (circuit breakers, alert cache, observation windows)
//! assume a single leader.
//!
//! ## Guarantees
//!
//! - **At-least-once execution.** Jobs survive restarts; a processor may
//!   run more than once across retries. Idempotency belongs to processors.
//! - **Priority then FIFO.** Within a queue, higher priority runs first;
//!   equal priorities run in enqueue order. No ordering across queues.
//! - **Failures are never silent.** Every failure becomes a retry with a
//!   cause label or a dead-letter entry with a category.

mod config;
mod dlq;
mod error;
mod events;
mod health;
mod job;
mod log;
mod manager;
mod monitor;
mod priority;
mod retry;
mod scheduler;
pub mod store;
pub mod tasks;
mod worker;

pub use config::{ConveyorConfig, QueueSettings, RetentionConfig};
pub use dlq::{DeadLetterQueue, DlqItem, DlqStats, RetriedRecord, DEFAULT_MAX_RESURRECTIONS};
pub use error::QueueError;
pub use events::{EventBus, QueueEvent};
pub use health::{
    CheckStatus, HealthCheck, HealthMonitor, HealthStatus, HealthThresholds, QueueHealth,
    ScalingAdvice,
};
pub use job::{wait_score, Job, JobCounts, JobOptions, JobState};
pub use log::JobLog;
pub use manager::{
    EnhancedSchedule, EnqueueOutcome, QueueManager, QueueStats, RepeatSpec, SystemHealth,
};
pub use monitor::{
    analyze_trend, Alert, AlertRule, AlertSeverity, Comparison, MetricKind, MetricsRecorder,
    MetricsSample, NoopRecorder, Predictions, QueueMonitor, TrendAnalysis, TrendDirection,
    METRICS_RETENTION_DAYS,
};
pub use priority::{Priority, PriorityContext, PriorityResolver};
pub use retry::{
    classify, classify_final, resolve_conditional, Backoff, BreakerDecision, BreakerMode,
    CircuitBreakers, CustomBackoffFn, CustomBackoffRegistry, ErrorCategory, ErrorClass,
};
pub use scheduler::{next_run_after, ChainedSpec, ConditionFn, JobScheduler, Schedule, ScheduledJob};
pub use store::{MemoryStore, RedisStore, Store, StoreConfig, StoreError};
pub use worker::{KindSettings, Processor, ProcessorRegistry, WorkerPool, WorkerPoolConfig};

// Re-export commonly used external types
pub use async_trait::async_trait;
