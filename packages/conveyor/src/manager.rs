//! The queue manager: one object wiring the store, job log, workers,
//! dead-letter queue, monitoring, health, and scheduler together, and
//! exposing the submitter and admin APIs.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ConveyorConfig;
use crate::dlq::{DeadLetterQueue, DlqStats};
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::health::{HealthMonitor, QueueHealth, ScalingAdvice};
use crate::job::{Job, JobCounts, JobOptions, JobState};
use crate::log::JobLog;
use crate::monitor::{
    MetricKind, MetricsRecorder, NoopRecorder, Predictions, QueueMonitor, TrendAnalysis,
};
use crate::priority::{PriorityContext, PriorityResolver};
use crate::retry::{BreakerMode, CircuitBreakers, CustomBackoffRegistry, ErrorCategory};
use crate::scheduler::{ChainedSpec, JobScheduler, Schedule, ScheduledJob};
use crate::worker::{KindSettings, Processor, ProcessorRegistry, WorkerPool, WorkerPoolConfig};

/// Repeat specification for enhanced submissions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepeatSpec {
    pub cron: Option<String>,
    pub every_ms: Option<u64>,
    /// Maximum number of runs.
    pub limit: Option<u32>,
}

/// Schedule options for [`QueueManager::enqueue_enhanced`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnhancedSchedule {
    pub delay_ms: Option<u64>,
    pub repeat: Option<RepeatSpec>,
    pub priority: Option<i32>,
}

/// What an enhanced submission produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A job landed in the log directly.
    Job(Uuid),
    /// A recurring schedule was registered.
    Schedule(String),
}

/// Point-in-time stats for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue: String,
    pub counts: JobCounts,
    pub dlq: DlqStats,
    pub breaker: BreakerMode,
}

/// Aggregate health over all configured queues.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall_score: u32,
    pub queues: Vec<QueueHealth>,
}

/// Central facade over the queue core.
pub struct QueueManager {
    config: ConveyorConfig,
    bus: EventBus,
    log: Arc<JobLog>,
    dlq: Arc<DeadLetterQueue>,
    monitor: Arc<QueueMonitor>,
    health: Arc<HealthMonitor>,
    scheduler: Arc<JobScheduler>,
    registry: Arc<ProcessorRegistry>,
    breakers: Arc<CircuitBreakers>,
    custom_backoff: Arc<CustomBackoffRegistry>,
    resolver: Arc<PriorityResolver>,
}

impl QueueManager {
    pub fn new(store: Arc<dyn crate::store::Store>, config: ConveyorConfig) -> Arc<Self> {
        Self::with_recorder(store, config, Arc::new(NoopRecorder))
    }

    /// Wire everything, publishing gauges through the given recorder.
    pub fn with_recorder(
        store: Arc<dyn crate::store::Store>,
        config: ConveyorConfig,
        recorder: Arc<dyn MetricsRecorder>,
    ) -> Arc<Self> {
        let bus = EventBus::default();
        let log = Arc::new(JobLog::new(store.clone(), bus.clone()));
        let dlq = Arc::new(DeadLetterQueue::new(store.clone()));
        let monitor = Arc::new(QueueMonitor::new(
            store.clone(),
            log.clone(),
            dlq.clone(),
            recorder,
        ));
        let health = Arc::new(HealthMonitor::new(store.clone()));
        let resolver = Arc::new(PriorityResolver::new());
        let scheduler = Arc::new(JobScheduler::new(store, log.clone(), resolver.clone()));
        let breakers = Arc::new(CircuitBreakers::new(
            config.breaker_threshold,
            config.breaker_timeout,
        ));

        Arc::new(Self {
            config,
            bus,
            log,
            dlq,
            monitor,
            health,
            scheduler,
            registry: Arc::new(ProcessorRegistry::new()),
            breakers,
            custom_backoff: Arc::new(CustomBackoffRegistry::new()),
            resolver,
        })
    }

    // --- Wiring accessors ---

    pub fn log(&self) -> &Arc<JobLog> {
        &self.log
    }

    pub fn dlq(&self) -> &Arc<DeadLetterQueue> {
        &self.dlq
    }

    pub fn monitor(&self) -> &Arc<QueueMonitor> {
        &self.monitor
    }

    pub fn scheduler(&self) -> &Arc<JobScheduler> {
        &self.scheduler
    }

    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    pub fn resolver(&self) -> &Arc<PriorityResolver> {
        &self.resolver
    }

    pub fn config(&self) -> &ConveyorConfig {
        &self.config
    }

    /// Configured queue names.
    pub fn queues(&self) -> Vec<String> {
        self.config.queues.keys().cloned().collect()
    }

    pub fn register_processor(
        &self,
        kind: impl Into<String>,
        processor: Arc<dyn Processor>,
        settings: KindSettings,
    ) {
        self.registry.register(kind, processor, settings);
    }

    fn require_queue(&self, queue: &str) -> Result<(), QueueError> {
        if self.config.queues.contains_key(queue) {
            Ok(())
        } else {
            Err(QueueError::InvalidQueue(queue.to_string()))
        }
    }

    // ------------------------------------------------------------------
    // Submitter API
    // ------------------------------------------------------------------

    /// Submit a job. Returns its id.
    pub async fn enqueue(
        &self,
        queue: &str,
        kind: &str,
        payload: serde_json::Value,
        opts: JobOptions,
    ) -> Result<Uuid, QueueError> {
        self.require_queue(queue)?;

        let now = Utc::now();
        let priority = match opts.priority {
            Some(p) => p,
            None => self.resolver.resolve(&PriorityContext {
                kind,
                payload: &payload,
                metadata: &serde_json::Value::Null,
                tags: &opts.tags,
                parent_id: opts.parent_id.as_deref(),
                enqueued_at: now,
            }),
        };

        let mut builder_job = Job::builder()
            .queue(queue)
            .kind(kind)
            .payload(payload)
            .priority(priority)
            .max_attempts(opts.attempts.unwrap_or(self.config.default_max_attempts))
            .backoff(
                opts.backoff
                    .unwrap_or_else(|| self.config.default_backoff.clone()),
            )
            .tags(opts.tags)
            .build();
        builder_job.parent_id = opts.parent_id;
        builder_job.timeout_ms = opts.timeout_ms;
        if let Some(delay) = opts.delay_ms {
            builder_job.scheduled_at = Some(now + chrono::Duration::milliseconds(delay as i64));
        }

        let job = self.log.enqueue(builder_job).await?;
        Ok(job.id)
    }

    /// Submit with scheduling options: a plain delay lands in the log, a
    /// repeat spec registers a schedule.
    pub async fn enqueue_enhanced(
        &self,
        queue: &str,
        kind: &str,
        payload: serde_json::Value,
        schedule: EnhancedSchedule,
    ) -> Result<EnqueueOutcome, QueueError> {
        self.require_queue(queue)?;

        if let Some(repeat) = schedule.repeat {
            let spec = match (&repeat.cron, repeat.every_ms) {
                (Some(expr), _) => Schedule::Cron { expr: expr.clone() },
                (None, Some(every_ms)) => Schedule::Every { every_ms },
                (None, None) => {
                    return Err(QueueError::InvalidCron(
                        "repeat requires cron or every".to_string(),
                    ))
                }
            };
            let mut record = ScheduledJob::new(
                Uuid::new_v4().to_string(),
                queue,
                kind,
                payload,
                spec,
            );
            record.priority = schedule.priority;
            record.max_runs = repeat.limit;
            let record = self.scheduler.schedule(record).await?;
            return Ok(EnqueueOutcome::Schedule(record.id));
        }

        let opts = JobOptions {
            delay_ms: schedule.delay_ms,
            priority: schedule.priority,
            ..Default::default()
        };
        let id = self.enqueue(queue, kind, payload, opts).await?;
        Ok(EnqueueOutcome::Job(id))
    }

    // ------------------------------------------------------------------
    // Admin API: jobs
    // ------------------------------------------------------------------

    pub async fn stats(&self, queue: &str) -> Result<QueueStats, QueueError> {
        self.require_queue(queue)?;
        Ok(QueueStats {
            queue: queue.to_string(),
            counts: self.log.counts(queue).await?,
            dlq: self.dlq.stats(queue).await?,
            breaker: self.breakers.mode(queue),
        })
    }

    pub async fn jobs(
        &self,
        queue: &str,
        state: JobState,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Job>, QueueError> {
        self.require_queue(queue)?;
        self.log.jobs_by_state(queue, state, limit, offset).await
    }

    pub async fn job_info(&self, queue: &str, id: Uuid) -> Result<Job, QueueError> {
        self.require_queue(queue)?;
        self.log
            .job(queue, id)
            .await?
            .ok_or(QueueError::JobNotFound(id))
    }

    /// Put a finished or dead job back on the queue with a fresh budget.
    pub async fn requeue(&self, queue: &str, id: Uuid) -> Result<(), QueueError> {
        self.require_queue(queue)?;
        self.log.requeue(queue, id).await?;
        Ok(())
    }

    /// Remove every job structure for a queue.
    pub async fn purge_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.require_queue(queue)?;
        self.log.purge(queue).await
    }

    // ------------------------------------------------------------------
    // Admin API: dead letters
    // ------------------------------------------------------------------

    pub async fn dlq_list(
        &self,
        queue: &str,
        category: Option<ErrorCategory>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<crate::dlq::DlqItem>, QueueError> {
        self.require_queue(queue)?;
        self.dlq.list(queue, category, limit, offset).await
    }

    /// Resurrect one dead-lettered item back onto its origin queue.
    pub async fn dlq_resurrect(&self, queue: &str, id: &str) -> Result<Uuid, QueueError> {
        self.require_queue(queue)?;
        let item = self.dlq.resurrect(queue, id).await?;

        let job_id = match Uuid::parse_str(&item.id) {
            Ok(uuid) => match self.log.requeue(queue, uuid).await {
                Ok(job) => job.id,
                // The job record aged out; rebuild it from the preserved item.
                Err(QueueError::JobNotFound(_)) => self.reenqueue_item(&item).await?,
                Err(e) => return Err(e),
            },
            Err(_) => self.reenqueue_item(&item).await?,
        };

        self.bus.emit(QueueEvent::Resurrected {
            queue: queue.to_string(),
            job_id,
        });
        info!(queue = %queue, job_id = %job_id, "dead-letter item resurrected");
        Ok(job_id)
    }

    async fn reenqueue_item(&self, item: &crate::dlq::DlqItem) -> Result<Uuid, QueueError> {
        let job = Job::builder()
            .queue(item.queue.clone())
            .kind(item.kind.clone())
            .payload(item.payload.clone())
            .priority(item.priority)
            .max_attempts(item.max_attempts)
            .backoff(item.backoff.clone())
            .tags(item.tags.clone())
            .build();
        let job = self.log.enqueue(job).await?;
        Ok(job.id)
    }

    /// Resurrect every item in a category. Items at their resurrection cap
    /// are skipped; re-running after full success is a no-op.
    pub async fn dlq_bulk_resurrect(
        &self,
        queue: &str,
        category: ErrorCategory,
    ) -> Result<usize, QueueError> {
        self.require_queue(queue)?;
        let items = self.dlq.list(queue, Some(category), 10_000, 0).await?;
        let mut resurrected = 0;
        for item in items {
            match self.dlq_resurrect(queue, &item.id).await {
                Ok(_) => resurrected += 1,
                Err(QueueError::ResurrectionLimit(id)) => {
                    warn!(queue = %queue, id = %id, "skipping item at resurrection cap");
                }
                Err(QueueError::DlqItemNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(resurrected)
    }

    pub async fn dlq_purge(
        &self,
        queue: &str,
        older_than_days: i64,
        category: Option<ErrorCategory>,
    ) -> Result<usize, QueueError> {
        self.require_queue(queue)?;
        self.dlq.purge(queue, older_than_days, category).await
    }

    /// Resurrect every item whose scheduled auto-retry is due.
    pub async fn process_scheduled_retries(&self, queue: &str) -> Result<usize, QueueError> {
        self.require_queue(queue)?;
        let due = self.dlq.due_retries(queue, Utc::now()).await?;
        let mut processed = 0;
        for id in due {
            match self.dlq_resurrect(queue, &id).await {
                Ok(_) => processed += 1,
                Err(QueueError::ResurrectionLimit(_)) => {
                    // Cap reached: drop the schedule so it stops firing.
                    if let Err(e) = self.dlq.unschedule(queue, &id).await {
                        warn!(queue = %queue, id = %id, error = %e, "failed to unschedule");
                    }
                }
                Err(QueueError::DlqItemNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        if processed > 0 {
            info!(queue = %queue, processed, "processed scheduled dead-letter retries");
        }
        Ok(processed)
    }

    // ------------------------------------------------------------------
    // Admin API: health and analytics
    // ------------------------------------------------------------------

    /// Evaluate, persist, and return the health report for one queue.
    pub async fn health_report(&self, queue: &str) -> Result<QueueHealth, QueueError> {
        self.require_queue(queue)?;
        let sample = self.monitor.snapshot(queue).await?;
        let report = self.health.evaluate(queue, &sample);
        self.health.persist(&report).await?;

        let workers = self
            .config
            .queues
            .get(queue)
            .map(|s| s.concurrency)
            .unwrap_or(1);
        let advice = self.health.scaling_advice(queue, &sample, workers);
        self.health.persist_scaling(&advice).await?;
        Ok(report)
    }

    /// Health across every configured queue, evaluated concurrently.
    pub async fn system_health(&self) -> Result<SystemHealth, QueueError> {
        let queues = self.queues();
        let reports = futures::future::join_all(
            queues.iter().map(|queue| self.health_report(queue)),
        )
        .await
        .into_iter()
        .collect::<Result<Vec<_>, _>>()?;
        let overall = if reports.is_empty() {
            100
        } else {
            (reports.iter().map(|r| r.score as u64).sum::<u64>() / reports.len() as u64) as u32
        };
        Ok(SystemHealth {
            overall_score: overall,
            queues: reports,
        })
    }

    pub async fn scaling_advice(&self, queue: &str) -> Result<ScalingAdvice, QueueError> {
        self.require_queue(queue)?;
        let sample = self.monitor.snapshot(queue).await?;
        let workers = self
            .config
            .queues
            .get(queue)
            .map(|s| s.concurrency)
            .unwrap_or(1);
        Ok(self.health.scaling_advice(queue, &sample, workers))
    }

    pub async fn trend(
        &self,
        queue: &str,
        metric: MetricKind,
    ) -> Result<TrendAnalysis, QueueError> {
        self.require_queue(queue)?;
        self.monitor.trend(queue, metric).await
    }

    pub async fn predict(&self, queue: &str) -> Result<Predictions, QueueError> {
        self.require_queue(queue)?;
        self.monitor.predict(queue).await
    }

    // ------------------------------------------------------------------
    // Admin API: scheduler passthrough
    // ------------------------------------------------------------------

    pub async fn schedule_chain(
        &self,
        parent_id: &str,
        spec: ChainedSpec,
    ) -> Result<(), QueueError> {
        self.scheduler.chain(parent_id, spec).await
    }

    // ------------------------------------------------------------------
    // Services
    // ------------------------------------------------------------------

    /// Spawn the per-queue worker pools and the monitor's event consumer.
    /// Periodic maintenance is wired separately in [`crate::tasks`].
    pub fn start(&self, shutdown: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();

        for (queue, settings) in &self.config.queues {
            let pool = Arc::new(WorkerPool::new(
                queue.clone(),
                self.log.clone(),
                self.dlq.clone(),
                self.registry.clone(),
                self.breakers.clone(),
                self.custom_backoff.clone(),
                self.bus.clone(),
                WorkerPoolConfig {
                    concurrency: settings.concurrency,
                    ..Default::default()
                },
            ));
            handles.extend(pool.spawn(shutdown.clone()));
        }

        let monitor = self.monitor.clone();
        let bus = self.bus.clone();
        let monitor_shutdown = shutdown.clone();
        handles.push(tokio::spawn(async move {
            monitor.run(bus, monitor_shutdown).await;
        }));

        info!(queues = self.config.queues.len(), "queue manager started");
        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn manager() -> Arc<QueueManager> {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let config = ConveyorConfig::default()
            .with_queue("contract-deploy", 2)
            .with_queue("tts", 4);
        QueueManager::new(store, config)
    }

    #[tokio::test]
    async fn enqueue_rejects_unknown_queue() {
        let m = manager();
        let err = m
            .enqueue("nope", "tts", json!({}), JobOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QueueError::InvalidQueue(_)));
    }

    #[tokio::test]
    async fn enqueue_resolves_priority_from_payload() {
        let m = manager();
        let id = m
            .enqueue(
                "contract-deploy",
                "contract-deploy",
                json!({ "environment": "production" }),
                JobOptions::default(),
            )
            .await
            .unwrap();

        let job = m.job_info("contract-deploy", id).await.unwrap();
        assert_eq!(job.priority, 20);
        assert_eq!(job.max_attempts, 3);
    }

    #[tokio::test]
    async fn enqueue_with_delay_lands_in_delayed_state() {
        let m = manager();
        let id = m
            .enqueue(
                "tts",
                "tts",
                json!({ "text": "hi" }),
                JobOptions {
                    delay_ms: Some(60_000),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = m.job_info("tts", id).await.unwrap();
        assert_eq!(job.state, JobState::Delayed);
    }

    #[tokio::test]
    async fn enhanced_with_repeat_registers_schedule() {
        let m = manager();
        let outcome = m
            .enqueue_enhanced(
                "tts",
                "tts",
                json!({ "text": "hourly" }),
                EnhancedSchedule {
                    repeat: Some(RepeatSpec {
                        cron: Some("0 * * * *".to_string()),
                        every_ms: None,
                        limit: Some(10),
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let EnqueueOutcome::Schedule(id) = outcome else {
            panic!("expected a schedule");
        };
        let record = m.scheduler().get(&id).await.unwrap().unwrap();
        assert_eq!(record.max_runs, Some(10));
        assert!(record.next_run.is_some());
    }

    #[tokio::test]
    async fn enhanced_without_repeat_is_a_plain_job() {
        let m = manager();
        let outcome = m
            .enqueue_enhanced(
                "tts",
                "tts",
                json!({ "text": "now" }),
                EnhancedSchedule::default(),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Job(_)));
    }

    #[tokio::test]
    async fn stats_cover_counts_dlq_and_breaker() {
        let m = manager();
        m.enqueue("tts", "tts", json!({ "text": "hi" }), JobOptions::default())
            .await
            .unwrap();

        let stats = m.stats("tts").await.unwrap();
        assert_eq!(stats.counts.waiting, 1);
        assert_eq!(stats.dlq.total, 0);
        assert_eq!(stats.breaker, BreakerMode::Closed);
    }

    #[tokio::test]
    async fn job_info_unknown_id_errors() {
        let m = manager();
        let err = m.job_info("tts", Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound(_)));
    }

    #[tokio::test]
    async fn resurrect_returns_job_to_origin_queue() {
        let m = manager();
        // Dead-letter a job by hand through the log + dlq pair.
        let job = m
            .log()
            .enqueue(
                Job::builder()
                    .queue("tts")
                    .kind("tts")
                    .payload(json!({ "text": "hi" }))
                    .build(),
            )
            .await
            .unwrap();
        let mut active = m.log().next_ready("tts").await.unwrap().unwrap();
        m.log().mark_dead(&mut active, "boom").await.unwrap();
        let item = crate::dlq::DlqItem::from_job(
            &active,
            "boom",
            ErrorCategory::UnknownError,
            true,
            Some(Utc::now() - chrono::Duration::seconds(1)),
        );
        m.dlq().add(&item).await.unwrap();

        let processed = m.process_scheduled_retries("tts").await.unwrap();
        assert_eq!(processed, 1);

        let revived = m.log().next_ready("tts").await.unwrap().unwrap();
        assert_eq!(revived.id, job.id);
        assert_eq!(m.dlq().size("tts").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn system_health_averages_queues() {
        let m = manager();
        let health = m.system_health().await.unwrap();
        assert_eq!(health.queues.len(), 2);
        assert_eq!(health.overall_score, 100);
    }
}
