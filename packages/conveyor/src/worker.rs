//! Per-queue worker pool.
//!
//! Each pool runs a bounded number of workers against one queue. A worker
//! loops: pop the highest-priority ready job, run its processor under the
//! per-kind deadline, then mark the result. Failures flow through the retry
//! policy: classify, consult the circuit breaker, reschedule or dead-letter.
//!
//! ```text
//! WorkerPool (N workers per queue)
//!     │
//!     ├─► JobLog.next_ready()          (priority DESC, FIFO within)
//!     ├─► CircuitBreakers.check()      (open queue → straight to DLQ)
//!     ├─► Processor.execute() + deadline
//!     └─► completed │ retry(backoff) │ dead-letter
//! ```

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dlq::{DeadLetterQueue, DlqItem};
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::job::Job;
use crate::log::JobLog;
use crate::retry::{
    classify_final, BreakerDecision, CircuitBreakers, CustomBackoffRegistry, ErrorCategory,
    ErrorClass,
};

// ============================================================================
// Processors
// ============================================================================

/// Executes jobs of one kind. Implementations never swallow errors: every
/// failure returns `Err`, which the pool turns into a retry or a
/// dead-letter entry with a cause label.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn execute(&self, job: &Job) -> anyhow::Result<()>;
}

/// Per-kind execution settings.
#[derive(Debug, Clone)]
pub struct KindSettings {
    /// Processor deadline.
    pub timeout: Duration,
}

impl Default for KindSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
        }
    }
}

impl KindSettings {
    /// Built-in deadlines for the known kinds; 30 s otherwise.
    pub fn for_kind(kind: &str) -> Self {
        let timeout = match kind {
            "contract-deploy" => Duration::from_secs(60),
            "tts" => Duration::from_secs(30),
            "news-index" => Duration::from_secs(120),
            _ => Duration::from_secs(30),
        };
        Self { timeout }
    }
}

struct RegisteredProcessor {
    processor: Arc<dyn Processor>,
    settings: KindSettings,
}

/// Registry mapping job kinds to processors. Dispatching an unregistered
/// kind is a permanent failure.
#[derive(Default)]
pub struct ProcessorRegistry {
    processors: DashMap<String, RegisteredProcessor>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        kind: impl Into<String>,
        processor: Arc<dyn Processor>,
        settings: KindSettings,
    ) {
        let kind = kind.into();
        if self.processors.contains_key(&kind) {
            panic!("processor already registered for kind: {kind}");
        }
        self.processors
            .insert(kind, RegisteredProcessor { processor, settings });
    }

    pub fn has(&self, kind: &str) -> bool {
        self.processors.contains_key(kind)
    }

    fn get(&self, kind: &str) -> Option<(Arc<dyn Processor>, KindSettings)> {
        self.processors
            .get(kind)
            .map(|r| (r.processor.clone(), r.settings.clone()))
    }
}

// ============================================================================
// Worker pool
// ============================================================================

/// Configuration for one queue's pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of concurrent workers.
    pub concurrency: usize,
    /// Sleep when the queue is empty.
    pub poll_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// How a failure reached the pool.
enum FailureOrigin {
    /// The processor ran and returned an error (or timed out).
    Executed,
    /// The circuit breaker rejected the job before execution.
    BreakerRejected,
}

/// Bounded pool of workers for a single queue.
pub struct WorkerPool {
    queue: String,
    log: Arc<JobLog>,
    dlq: Arc<DeadLetterQueue>,
    registry: Arc<ProcessorRegistry>,
    breakers: Arc<CircuitBreakers>,
    custom_backoff: Arc<CustomBackoffRegistry>,
    bus: EventBus,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        queue: impl Into<String>,
        log: Arc<JobLog>,
        dlq: Arc<DeadLetterQueue>,
        registry: Arc<ProcessorRegistry>,
        breakers: Arc<CircuitBreakers>,
        custom_backoff: Arc<CustomBackoffRegistry>,
        bus: EventBus,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            queue: queue.into(),
            log,
            dlq,
            registry,
            breakers,
            custom_backoff,
            bus,
            config,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn concurrency(&self) -> usize {
        self.config.concurrency
    }

    /// Spawn the configured number of workers.
    pub fn spawn(self: Arc<Self>, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.config.concurrency)
            .map(|idx| {
                let pool = self.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { pool.worker_loop(idx, shutdown).await })
            })
            .collect()
    }

    async fn worker_loop(&self, idx: usize, shutdown: CancellationToken) {
        info!(queue = %self.queue, worker = idx, "worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }
            match self.run_once().await {
                Ok(true) => {}
                Ok(false) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                }
                Err(e) => {
                    error!(queue = %self.queue, worker = idx, error = %e, "worker poll failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        info!(queue = %self.queue, worker = idx, "worker stopped");
    }

    /// Pop and process at most one job. Returns whether a job was found.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(job) = self.log.next_ready(&self.queue).await? else {
            return Ok(false);
        };
        self.process(job).await?;
        Ok(true)
    }

    async fn process(&self, mut job: Job) -> Result<(), QueueError> {
        self.bus.emit(QueueEvent::Started {
            queue: job.queue.clone(),
            job_id: job.id,
            kind: job.kind.clone(),
            attempt: job.attempts_made,
        });

        let Some((processor, settings)) = self.registry.get(&job.kind) else {
            warn!(queue = %self.queue, job_id = %job.id, kind = %job.kind, "no processor for kind");
            let error = format!("unknown job kind: {}", job.kind);
            return self
                .dead_letter(job, &error, ErrorCategory::ValidationError, false)
                .await;
        };

        match self.breakers.check(&self.queue) {
            BreakerDecision::Reject => {
                let error = format!("circuit breaker open for queue {}", self.queue);
                return self
                    .handle_failure(job, &error, FailureOrigin::BreakerRejected)
                    .await;
            }
            BreakerDecision::Allow | BreakerDecision::Probe => {}
        }

        let deadline = job
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(settings.timeout);
        let started = std::time::Instant::now();

        match tokio::time::timeout(deadline, processor.execute(&job)).await {
            Ok(Ok(())) => {
                self.breakers.record_success(&self.queue);
                self.log.mark_completed(&mut job).await?;
                let duration_ms = started.elapsed().as_millis() as u64;
                debug!(queue = %self.queue, job_id = %job.id, duration_ms, "job completed");
                self.bus.emit(QueueEvent::Completed {
                    queue: job.queue.clone(),
                    job_id: job.id,
                    kind: job.kind.clone(),
                    duration_ms,
                });
                Ok(())
            }
            Ok(Err(e)) => {
                self.breakers.record_failure(&self.queue);
                self.handle_failure(job, &e.to_string(), FailureOrigin::Executed)
                    .await
            }
            Err(_) => {
                self.breakers.record_failure(&self.queue);
                let error = format!(
                    "timeout: processor exceeded {}ms deadline",
                    deadline.as_millis()
                );
                self.handle_failure(job, &error, FailureOrigin::Executed)
                    .await
            }
        }
    }

    /// The failure path: classify, then retry or dead-letter.
    async fn handle_failure(
        &self,
        job: Job,
        error: &str,
        origin: FailureOrigin,
    ) -> Result<(), QueueError> {
        let (category, class) = classify_final(error);

        // Permanent errors are terminal no matter how many attempts remain.
        if class == ErrorClass::Permanent {
            return self.dead_letter(job, error, category, false).await;
        }

        // An open breaker makes the failure terminal on this attempt, but
        // the item stays retryable through the DLQ schedule.
        if matches!(origin, FailureOrigin::BreakerRejected) {
            return self.dead_letter(job, error, category, true).await;
        }

        if job.retries_remaining() {
            let delay = self.custom_backoff.resolve(&job.backoff, job.attempts_made);
            let ready_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .unwrap_or_else(|_| chrono::Duration::seconds(2));
            let mut job = job;
            warn!(
                queue = %self.queue,
                job_id = %job.id,
                attempt = job.attempts_made,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "job failed, retry scheduled"
            );
            self.log.mark_retry(&mut job, error, ready_at).await?;
            self.bus.emit(QueueEvent::Failed {
                queue: job.queue.clone(),
                job_id: job.id,
                kind: job.kind.clone(),
                error: error.to_string(),
                attempt: job.attempts_made,
                will_retry: true,
            });
            return Ok(());
        }

        self.dead_letter(job, error, category, true).await
    }

    /// Terminal failure: move the job to the dead-letter queue.
    async fn dead_letter(
        &self,
        mut job: Job,
        error: &str,
        category: ErrorCategory,
        can_retry: bool,
    ) -> Result<(), QueueError> {
        let next_retry_at = if can_retry {
            let delay = self.custom_backoff.resolve(&job.backoff, job.attempts_made.max(1));
            Some(
                Utc::now()
                    + chrono::Duration::from_std(delay)
                        .unwrap_or_else(|_| chrono::Duration::seconds(2)),
            )
        } else {
            None
        };

        self.bus.emit(QueueEvent::Failed {
            queue: job.queue.clone(),
            job_id: job.id,
            kind: job.kind.clone(),
            error: error.to_string(),
            attempt: job.attempts_made,
            will_retry: false,
        });

        self.log.mark_dead(&mut job, error).await?;
        let item = DlqItem::from_job(&job, error, category, can_retry, next_retry_at);
        self.dlq.add(&item).await?;

        error!(
            queue = %self.queue,
            job_id = %job.id,
            kind = %job.kind,
            category = category.as_str(),
            can_retry,
            error = %error,
            "job dead-lettered"
        );
        self.bus.emit(QueueEvent::DeadLettered {
            queue: job.queue.clone(),
            job_id: job.id,
            kind: job.kind.clone(),
            category,
            can_retry,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::retry::Backoff;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct FailNTimes {
        failures: u32,
        error: &'static str,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Processor for FailNTimes {
        async fn execute(&self, _job: &Job) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                anyhow::bail!("{}", self.error);
            }
            Ok(())
        }
    }

    struct SleepFor(Duration);

    #[async_trait]
    impl Processor for SleepFor {
        async fn execute(&self, _job: &Job) -> anyhow::Result<()> {
            tokio::time::sleep(self.0).await;
            Ok(())
        }
    }

    struct Harness {
        log: Arc<JobLog>,
        dlq: Arc<DeadLetterQueue>,
        pool: Arc<WorkerPool>,
    }

    fn harness(registry: ProcessorRegistry, breaker_timeout: Duration) -> Harness {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let bus = EventBus::new(256);
        let log = Arc::new(JobLog::new(store.clone(), bus.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(store));
        let pool = Arc::new(WorkerPool::new(
            "q",
            log.clone(),
            dlq.clone(),
            Arc::new(registry),
            Arc::new(CircuitBreakers::new(5, breaker_timeout)),
            Arc::new(CustomBackoffRegistry::new()),
            bus,
            WorkerPoolConfig {
                concurrency: 1,
                poll_interval: Duration::from_millis(10),
            },
        ));
        Harness { log, dlq, pool }
    }

    /// Drive the pool until the queue drains (including delayed retries) or
    /// the deadline passes.
    async fn drive(h: &Harness, deadline: Duration) {
        let until = tokio::time::Instant::now() + deadline;
        loop {
            let worked = h.pool.run_once().await.unwrap();
            if !worked {
                let counts = h.log.counts("q").await.unwrap();
                if counts.backlog() == 0 && counts.active == 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
            if tokio::time::Instant::now() >= until {
                break;
            }
        }
    }

    fn retrying_job(max_attempts: u32) -> Job {
        Job::builder()
            .queue("q")
            .kind("flaky")
            .max_attempts(max_attempts)
            .backoff(Backoff::Fixed { delay_ms: 30 })
            .build()
    }

    #[tokio::test]
    async fn transient_failures_retry_then_succeed() {
        let registry = ProcessorRegistry::new();
        let calls = Arc::new(FailNTimes {
            failures: 3,
            error: "connect ETIMEDOUT upstream",
            calls: AtomicU32::new(0),
        });
        registry.register("flaky", calls.clone(), KindSettings::default());
        let h = harness(registry, Duration::from_secs(60));

        let job = h.log.enqueue(retrying_job(5)).await.unwrap();
        drive(&h, Duration::from_secs(5)).await;

        let done = h.log.job("q", job.id).await.unwrap().unwrap();
        assert_eq!(done.state, crate::job::JobState::Completed);
        assert_eq!(done.attempts_made, 4);
        assert_eq!(calls.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.dlq.size("q").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn validation_errors_dead_letter_without_retry() {
        let registry = ProcessorRegistry::new();
        registry.register(
            "flaky",
            Arc::new(FailNTimes {
                failures: u32::MAX,
                error: "validation failed: bad contract code",
                calls: AtomicU32::new(0),
            }),
            KindSettings::default(),
        );
        let h = harness(registry, Duration::from_secs(60));

        h.log.enqueue(retrying_job(5)).await.unwrap();
        drive(&h, Duration::from_secs(2)).await;

        let items = h.dlq.list("q", None, 10, 0).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].category, ErrorCategory::ValidationError);
        assert!(!items[0].can_retry);
        assert!(items[0].next_retry_at.is_none());
        assert_eq!(items[0].attempts, 1, "permanent errors stop after one attempt");
        assert!(h.dlq.due_retries("q", Utc::now()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_as_retryable() {
        let registry = ProcessorRegistry::new();
        registry.register(
            "flaky",
            Arc::new(FailNTimes {
                failures: u32::MAX,
                error: "network unreachable",
                calls: AtomicU32::new(0),
            }),
            KindSettings::default(),
        );
        let h = harness(registry, Duration::from_secs(60));

        h.log.enqueue(retrying_job(2)).await.unwrap();
        drive(&h, Duration::from_secs(3)).await;

        let items = h.dlq.list("q", None, 10, 0).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, 2);
        assert!(items[0].can_retry);
        assert!(items[0].next_retry_at.is_some());
    }

    #[tokio::test]
    async fn unknown_kind_is_a_permanent_failure() {
        let h = harness(ProcessorRegistry::new(), Duration::from_secs(60));
        h.log
            .enqueue(Job::builder().queue("q").kind("nobody-home").build())
            .await
            .unwrap();
        drive(&h, Duration::from_secs(1)).await;

        let items = h.dlq.list("q", None, 10, 0).await.unwrap();
        assert_eq!(items.len(), 1);
        assert!(!items[0].can_retry);
    }

    #[tokio::test]
    async fn deadline_overrun_counts_as_timeout() {
        let registry = ProcessorRegistry::new();
        registry.register(
            "flaky",
            Arc::new(SleepFor(Duration::from_millis(300))),
            KindSettings::default(),
        );
        let h = harness(registry, Duration::from_secs(60));

        let mut job = retrying_job(1);
        job.timeout_ms = Some(40);
        h.log.enqueue(job).await.unwrap();
        drive(&h, Duration::from_secs(2)).await;

        let items = h.dlq.list("q", None, 10, 0).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].category, ErrorCategory::TimeoutError);
        assert!(items[0].can_retry);
    }

    #[tokio::test]
    async fn open_breaker_skips_execution_then_probe_closes_it() {
        let registry = ProcessorRegistry::new();
        let counter = Arc::new(FailNTimes {
            failures: 5,
            error: "upstream 503 server error",
            calls: AtomicU32::new(0),
        });
        registry.register("flaky", counter.clone(), KindSettings::default());
        let h = harness(registry, Duration::from_millis(120));

        // Five consecutive failures open the breaker.
        for _ in 0..5 {
            h.log.enqueue(retrying_job(1)).await.unwrap();
        }
        drive(&h, Duration::from_secs(2)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 5);

        // The sixth submission is not attempted: the processor is never
        // invoked and the job dead-letters as retryable.
        h.log.enqueue(retrying_job(1)).await.unwrap();
        drive(&h, Duration::from_secs(1)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 5);
        assert_eq!(h.dlq.size("q").await.unwrap(), 6);

        // After the cooldown, one probe runs; it succeeds (failures are
        // exhausted) and the breaker closes with its counter reset.
        tokio::time::sleep(Duration::from_millis(150)).await;
        h.log.enqueue(retrying_job(1)).await.unwrap();
        drive(&h, Duration::from_secs(1)).await;
        assert_eq!(counter.calls.load(Ordering::SeqCst), 6);
        assert_eq!(h.dlq.size("q").await.unwrap(), 6);

        let counts = h.log.counts("q").await.unwrap();
        assert_eq!(counts.completed, 1);
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_processor_registration_panics() {
        let registry = ProcessorRegistry::new();
        registry.register(
            "k",
            Arc::new(SleepFor(Duration::ZERO)),
            KindSettings::default(),
        );
        registry.register(
            "k",
            Arc::new(SleepFor(Duration::ZERO)),
            KindSettings::default(),
        );
    }

    #[test]
    fn kind_settings_deadlines() {
        assert_eq!(
            KindSettings::for_kind("contract-deploy").timeout,
            Duration::from_secs(60)
        );
        assert_eq!(KindSettings::for_kind("tts").timeout, Duration::from_secs(30));
        assert_eq!(
            KindSettings::for_kind("news-index").timeout,
            Duration::from_secs(120)
        );
        assert_eq!(KindSettings::for_kind("other").timeout, Duration::from_secs(30));
    }
}
