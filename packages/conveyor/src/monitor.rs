//! Queue monitoring.
//!
//! The monitor consumes the queue event stream (never polls the job log on
//! the hot path), keeps a one-hour in-memory window per queue, and every
//! sampling tick persists a snapshot: per-state counts, processing-time
//! percentiles, hourly throughput, failure rate, and DLQ size. History is
//! retained for 30 days.
//!
//! On top of the history it offers threshold alerts, least-squares trend
//! analysis, and coarse 24-hour predictions.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::dlq::DeadLetterQueue;
use crate::error::QueueError;
use crate::events::{EventBus, QueueEvent};
use crate::job::JobCounts;
use crate::log::JobLog;
use crate::store::{keys, Store};

/// How long samples are kept.
pub const METRICS_RETENTION_DAYS: i64 = 30;

/// In-memory observation window.
fn window_span() -> chrono::Duration {
    chrono::Duration::minutes(60)
}

// ============================================================================
// Recorder seam
// ============================================================================

/// Sink for gauge values, consumed by an external analytics store.
pub trait MetricsRecorder: Send + Sync {
    fn record(&self, queue: &str, name: &str, value: f64);
}

/// Recorder that drops everything.
#[derive(Default)]
pub struct NoopRecorder;

impl MetricsRecorder for NoopRecorder {
    fn record(&self, _queue: &str, _name: &str, _value: f64) {}
}

// ============================================================================
// Samples
// ============================================================================

/// One timestamped metrics snapshot for a queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSample {
    pub ts: DateTime<Utc>,
    pub counts: JobCounts,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
    pub avg_processing_ms: u64,
    /// Completions in the trailing 60 minutes.
    pub throughput_per_hour: u64,
    /// Failures / (failures + completions) over the window.
    pub failure_rate: f64,
    pub dlq_size: u64,
}

/// Which series a rule or trend refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricKind {
    FailureRate,
    ThroughputPerHour,
    Backlog,
    DlqSize,
    P95Latency,
    AvgProcessingTime,
}

impl MetricKind {
    pub fn value_in(&self, sample: &MetricsSample) -> f64 {
        match self {
            MetricKind::FailureRate => sample.failure_rate,
            MetricKind::ThroughputPerHour => sample.throughput_per_hour as f64,
            MetricKind::Backlog => sample.counts.backlog() as f64,
            MetricKind::DlqSize => sample.dlq_size as f64,
            MetricKind::P95Latency => sample.p95_ms as f64,
            MetricKind::AvgProcessingTime => sample.avg_processing_ms as f64,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::FailureRate => "failure_rate",
            MetricKind::ThroughputPerHour => "throughput_per_hour",
            MetricKind::Backlog => "backlog",
            MetricKind::DlqSize => "dlq_size",
            MetricKind::P95Latency => "p95_latency",
            MetricKind::AvgProcessingTime => "avg_processing_time",
        }
    }
}

// ============================================================================
// Alerts
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Lt,
    Eq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
}

/// Fires when `metric <comparison> threshold` holds for `duration`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertRule {
    pub metric: MetricKind,
    pub comparison: Comparison,
    pub threshold: f64,
    #[serde(with = "humantime_ms")]
    pub duration: Duration,
    pub severity: AlertSeverity,
}

mod humantime_ms {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = <u64 as serde::Deserialize>::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

impl AlertRule {
    fn holds(&self, value: f64) -> bool {
        match self.comparison {
            Comparison::Gt => value > self.threshold,
            Comparison::Lt => value < self.threshold,
            Comparison::Eq => (value - self.threshold).abs() < f64::EPSILON,
        }
    }
}

/// An alert that fired.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub queue: String,
    pub metric: MetricKind,
    pub severity: AlertSeverity,
    pub value: f64,
    pub threshold: f64,
    pub triggered_at: DateTime<Utc>,
}

// ============================================================================
// Trends and predictions
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrendDirection {
    Increasing,
    Decreasing,
    Stable,
}

/// Ordinary-least-squares trend over historical samples.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub metric: MetricKind,
    pub slope: f64,
    pub direction: TrendDirection,
    /// `max(0, 1 - variance/mean)`; 0 when the mean is 0.
    pub confidence: f64,
    /// Last observed value plus one slope step.
    pub projection: f64,
    pub sample_count: usize,
}

/// Coarse 24-hour forward estimates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predictions {
    pub horizon_hours: u32,
    pub throughput_per_hour: f64,
    pub failure_rate: f64,
    pub backlog: f64,
    pub basis: TrendDirection,
}

/// Least squares of `values` against their index. Returns the slope.
fn ols_slope(values: &[f64]) -> f64 {
    let n = values.len();
    if n < 2 {
        return 0.0;
    }
    let n_f = n as f64;
    let mean_x = (n_f - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n_f;
    let mut num = 0.0;
    let mut den = 0.0;
    for (i, v) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        num += dx * (v - mean_y);
        den += dx * dx;
    }
    if den == 0.0 { 0.0 } else { num / den }
}

fn direction_for(slope: f64) -> TrendDirection {
    if slope > 0.1 {
        TrendDirection::Increasing
    } else if slope < -0.1 {
        TrendDirection::Decreasing
    } else {
        TrendDirection::Stable
    }
}

/// Fixed forward multiplier per trend direction.
fn prediction_multiplier(direction: TrendDirection) -> f64 {
    match direction {
        TrendDirection::Increasing => 1.2,
        TrendDirection::Decreasing => 0.8,
        TrendDirection::Stable => 1.0,
    }
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Default)]
struct Window {
    /// (finished_at, duration_ms) of completions.
    durations: VecDeque<(DateTime<Utc>, u64)>,
    failures: VecDeque<DateTime<Utc>>,
}

impl Window {
    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - window_span();
        while self.durations.front().map(|(at, _)| *at < cutoff).unwrap_or(false) {
            self.durations.pop_front();
        }
        while self.failures.front().map(|at| *at < cutoff).unwrap_or(false) {
            self.failures.pop_front();
        }
    }
}

/// Per-queue metrics collection, alerting, and trend analysis.
pub struct QueueMonitor {
    store: Arc<dyn Store>,
    log: Arc<JobLog>,
    dlq: Arc<DeadLetterQueue>,
    recorder: Arc<dyn MetricsRecorder>,
    windows: DashMap<String, Window>,
    rules: DashMap<String, Vec<AlertRule>>,
    active_alerts: DashMap<String, Vec<Alert>>,
    /// When each (queue, metric) condition started holding.
    pending: DashMap<(String, MetricKind), DateTime<Utc>>,
}

impl QueueMonitor {
    pub fn new(
        store: Arc<dyn Store>,
        log: Arc<JobLog>,
        dlq: Arc<DeadLetterQueue>,
        recorder: Arc<dyn MetricsRecorder>,
    ) -> Self {
        Self {
            store,
            log,
            dlq,
            recorder,
            windows: DashMap::new(),
            rules: DashMap::new(),
            active_alerts: DashMap::new(),
            pending: DashMap::new(),
        }
    }

    /// Install threshold rules for a queue, replacing any existing set.
    pub fn set_rules(&self, queue: impl Into<String>, rules: Vec<AlertRule>) {
        self.rules.insert(queue.into(), rules);
    }

    /// Feed one event into the in-memory window.
    pub fn observe(&self, event: &QueueEvent) {
        let now = Utc::now();
        match event {
            QueueEvent::Completed { queue, duration_ms, .. } => {
                let mut window = self.windows.entry(queue.clone()).or_default();
                window.durations.push_back((now, *duration_ms));
                window.prune(now);
            }
            QueueEvent::Failed { queue, .. } => {
                let mut window = self.windows.entry(queue.clone()).or_default();
                window.failures.push_back(now);
                window.prune(now);
            }
            _ => {}
        }
    }

    /// Consume the event stream until shutdown.
    pub async fn run(self: Arc<Self>, bus: EventBus, shutdown: CancellationToken) {
        let mut rx = bus.subscribe();
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = rx.recv() => match event {
                    Ok(event) => self.observe(&event),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "monitor lagged behind the event stream");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    /// Build a snapshot from the window plus current log and DLQ sizes.
    pub async fn snapshot(&self, queue: &str) -> Result<MetricsSample, QueueError> {
        let now = Utc::now();
        let counts = self.log.counts(queue).await?;
        let dlq_size = self.dlq.size(queue).await?;

        let (durations, failure_count) = {
            let mut window = self.windows.entry(queue.to_string()).or_default();
            window.prune(now);
            let durations: Vec<u64> = window.durations.iter().map(|(_, d)| *d).collect();
            (durations, window.failures.len() as u64)
        };

        let completions = durations.len() as u64;
        let attempts = completions + failure_count;
        let failure_rate = if attempts == 0 {
            0.0
        } else {
            failure_count as f64 / attempts as f64
        };

        let mut sorted = durations.clone();
        sorted.sort_unstable();
        let avg = if sorted.is_empty() {
            0
        } else {
            sorted.iter().sum::<u64>() / sorted.len() as u64
        };

        Ok(MetricsSample {
            ts: now,
            counts,
            p50_ms: percentile(&sorted, 50.0),
            p95_ms: percentile(&sorted, 95.0),
            p99_ms: percentile(&sorted, 99.0),
            avg_processing_ms: avg,
            throughput_per_hour: completions,
            failure_rate,
            dlq_size,
        })
    }

    /// Snapshot, persist into history, prune old samples, publish gauges,
    /// and evaluate alert rules.
    pub async fn record_sample(&self, queue: &str) -> Result<MetricsSample, QueueError> {
        let sample = self.snapshot(queue).await?;
        let ts = sample.ts.timestamp_millis();

        // Best-effort telemetry: a store hiccup here must not affect the
        // queues themselves.
        let encoded = serde_json::to_string(&sample)?;
        let index = keys::metrics_index(queue);
        let data = keys::metrics_data(queue);
        if let Err(e) = async {
            self.store.zset_add(&index, &ts.to_string(), ts as f64).await?;
            self.store.hash_set(&data, &ts.to_string(), &encoded).await?;
            Ok::<_, QueueError>(())
        }
        .await
        {
            warn!(queue = %queue, error = %e, "failed to persist metrics sample");
            return Ok(sample);
        }

        // Prune past the retention horizon.
        let cutoff =
            (Utc::now() - chrono::Duration::days(METRICS_RETENTION_DAYS)).timestamp_millis();
        if let Ok(stale) = self
            .store
            .zset_range_by_score(&index, f64::MIN, cutoff as f64, None)
            .await
        {
            for ts in &stale {
                let _ = self.store.hash_del(&data, ts).await;
            }
            let _ = self
                .store
                .zset_remove_range_by_score(&index, f64::MIN, cutoff as f64)
                .await;
        }

        for (name, value) in [
            ("throughput_per_hour", sample.throughput_per_hour as f64),
            ("failure_rate", sample.failure_rate),
            ("p95_ms", sample.p95_ms as f64),
            ("backlog", sample.counts.backlog() as f64),
            ("dlq_size", sample.dlq_size as f64),
        ] {
            self.recorder.record(queue, name, value);
        }

        self.check_alerts(queue, &sample);
        debug!(queue = %queue, throughput = sample.throughput_per_hour, "metrics sample recorded");
        Ok(sample)
    }

    /// Samples since `since`, oldest first.
    pub async fn history(
        &self,
        queue: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<MetricsSample>, QueueError> {
        let ids = self
            .store
            .zset_range_by_score(
                &keys::metrics_index(queue),
                since.timestamp_millis() as f64,
                f64::MAX,
                None,
            )
            .await?;
        let data = keys::metrics_data(queue);
        let mut samples = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(encoded) = self.store.hash_get(&data, &id).await? {
                match serde_json::from_str(&encoded) {
                    Ok(sample) => samples.push(sample),
                    Err(e) => warn!(queue = %queue, error = %e, "skipping undecodable sample"),
                }
            }
        }
        Ok(samples)
    }

    /// Evaluate rules against a fresh sample; returns alerts that fired now.
    pub fn check_alerts(&self, queue: &str, sample: &MetricsSample) -> Vec<Alert> {
        let Some(rules) = self.rules.get(queue) else {
            return Vec::new();
        };
        let now = sample.ts;
        let mut fired = Vec::new();

        for rule in rules.iter() {
            let value = rule.metric.value_in(sample);
            let key = (queue.to_string(), rule.metric);
            if rule.holds(value) {
                let since = *self.pending.entry(key).or_insert(now);
                if (now - since).to_std().unwrap_or_default() >= rule.duration {
                    let alert = Alert {
                        queue: queue.to_string(),
                        metric: rule.metric,
                        severity: rule.severity,
                        value,
                        threshold: rule.threshold,
                        triggered_at: now,
                    };
                    warn!(
                        queue = %queue,
                        metric = rule.metric.as_str(),
                        value,
                        threshold = rule.threshold,
                        severity = ?rule.severity,
                        "queue alert"
                    );
                    self.active_alerts
                        .entry(queue.to_string())
                        .or_default()
                        .push(alert.clone());
                    fired.push(alert);
                }
            } else {
                self.pending.remove(&key);
            }
        }
        fired
    }

    /// Alerts that fired within the last hour.
    pub fn active_alerts(&self, queue: &str) -> Vec<Alert> {
        let cutoff = Utc::now() - chrono::Duration::hours(1);
        self.active_alerts
            .get(queue)
            .map(|alerts| {
                alerts
                    .iter()
                    .filter(|a| a.triggered_at > cutoff)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// OLS trend for one metric over the last seven days of samples, cached
    /// in the store for an hour.
    pub async fn trend(
        &self,
        queue: &str,
        metric: MetricKind,
    ) -> Result<TrendAnalysis, QueueError> {
        let since = Utc::now() - chrono::Duration::days(7);
        let samples = self.history(queue, since).await?;
        let values: Vec<f64> = samples.iter().map(|s| metric.value_in(s)).collect();
        let analysis = analyze_trend(metric, &values);

        if let Ok(encoded) = serde_json::to_string(&analysis) {
            let _ = self
                .store
                .set_with_ttl(&keys::trends(queue), &encoded, Duration::from_secs(3600))
                .await;
        }
        Ok(analysis)
    }

    /// 24-hour prediction from historical means, scaled by the throughput
    /// trend direction. Cached for 30 minutes.
    pub async fn predict(&self, queue: &str) -> Result<Predictions, QueueError> {
        let since = Utc::now() - chrono::Duration::days(7);
        let samples = self.history(queue, since).await?;

        let mean = |f: &dyn Fn(&MetricsSample) -> f64| -> f64 {
            if samples.is_empty() {
                0.0
            } else {
                samples.iter().map(|s| f(s)).sum::<f64>() / samples.len() as f64
            }
        };

        let throughput: Vec<f64> = samples
            .iter()
            .map(|s| s.throughput_per_hour as f64)
            .collect();
        let direction = direction_for(ols_slope(&throughput));
        let multiplier = prediction_multiplier(direction);

        let predictions = Predictions {
            horizon_hours: 24,
            throughput_per_hour: mean(&|s| s.throughput_per_hour as f64) * multiplier,
            failure_rate: mean(&|s| s.failure_rate) * multiplier,
            backlog: mean(&|s| s.counts.backlog() as f64) * multiplier,
            basis: direction,
        };

        if let Ok(encoded) = serde_json::to_string(&predictions) {
            let _ = self
                .store
                .set_with_ttl(&keys::predictions(queue), &encoded, Duration::from_secs(1800))
                .await;
        }
        Ok(predictions)
    }
}

/// Trend math, separated for testability.
pub fn analyze_trend(metric: MetricKind, values: &[f64]) -> TrendAnalysis {
    let slope = ols_slope(values);
    let n = values.len();
    let mean = if n == 0 {
        0.0
    } else {
        values.iter().sum::<f64>() / n as f64
    };
    let variance = if n == 0 {
        0.0
    } else {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n as f64
    };
    let confidence = if mean.abs() < f64::EPSILON {
        0.0
    } else {
        (1.0 - variance / mean).max(0.0)
    };

    TrendAnalysis {
        metric,
        slope,
        direction: direction_for(slope),
        confidence,
        projection: values.last().copied().unwrap_or(0.0) + slope,
        sample_count: n,
    }
}

/// Nearest-rank percentile over an already sorted slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    if sorted.is_empty() {
        return 0;
    }
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use uuid::Uuid;

    fn monitor() -> Arc<QueueMonitor> {
        let store: Arc<MemoryStore> = Arc::new(MemoryStore::new());
        let bus = EventBus::new(64);
        let log = Arc::new(JobLog::new(store.clone(), bus));
        let dlq = Arc::new(DeadLetterQueue::new(store.clone()));
        Arc::new(QueueMonitor::new(store, log, dlq, Arc::new(NoopRecorder)))
    }

    fn completed(queue: &str, duration_ms: u64) -> QueueEvent {
        QueueEvent::Completed {
            queue: queue.to_string(),
            job_id: Uuid::new_v4(),
            kind: "tts".to_string(),
            duration_ms,
        }
    }

    fn failed(queue: &str) -> QueueEvent {
        QueueEvent::Failed {
            queue: queue.to_string(),
            job_id: Uuid::new_v4(),
            kind: "tts".to_string(),
            error: "boom".to_string(),
            attempt: 1,
            will_retry: false,
        }
    }

    #[test]
    fn percentile_nearest_rank() {
        let sorted: Vec<u64> = (1..=100).collect();
        assert_eq!(percentile(&sorted, 50.0), 50);
        assert_eq!(percentile(&sorted, 95.0), 95);
        assert_eq!(percentile(&sorted, 99.0), 99);
        assert_eq!(percentile(&[], 50.0), 0);
        assert_eq!(percentile(&[7], 99.0), 7);
    }

    #[tokio::test]
    async fn snapshot_reflects_observed_events() {
        let m = monitor();
        for d in [100, 200, 300, 400] {
            m.observe(&completed("q", d));
        }
        m.observe(&failed("q"));

        let sample = m.snapshot("q").await.unwrap();
        assert_eq!(sample.throughput_per_hour, 4);
        assert_eq!(sample.avg_processing_ms, 250);
        assert_eq!(sample.p50_ms, 200);
        assert!((sample.failure_rate - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn samples_persist_into_history() {
        let m = monitor();
        m.observe(&completed("q", 120));
        m.record_sample("q").await.unwrap();
        m.record_sample("q").await.unwrap();

        let since = Utc::now() - chrono::Duration::minutes(5);
        let history = m.history("q", since).await.unwrap();
        assert!(history.len() >= 1, "samples with equal ms collapse");
        assert_eq!(history[0].throughput_per_hour, 1);
    }

    #[test]
    fn ols_detects_directions() {
        let rising: Vec<f64> = (0..20).map(|i| i as f64).collect();
        assert_eq!(direction_for(ols_slope(&rising)), TrendDirection::Increasing);

        let falling: Vec<f64> = (0..20).map(|i| 100.0 - i as f64).collect();
        assert_eq!(direction_for(ols_slope(&falling)), TrendDirection::Decreasing);

        let flat = vec![5.0; 20];
        assert_eq!(direction_for(ols_slope(&flat)), TrendDirection::Stable);
        assert_eq!(ols_slope(&[]), 0.0);
    }

    #[test]
    fn trend_projection_and_confidence() {
        let values: Vec<f64> = (0..10).map(|i| 10.0 + i as f64).collect();
        let t = analyze_trend(MetricKind::ThroughputPerHour, &values);
        assert!((t.slope - 1.0).abs() < 1e-9);
        assert_eq!(t.direction, TrendDirection::Increasing);
        assert!((t.projection - 20.0).abs() < 1e-9);
        assert!(t.confidence > 0.0 && t.confidence <= 1.0);

        let flat = analyze_trend(MetricKind::ThroughputPerHour, &[4.0; 8]);
        assert!((flat.confidence - 1.0).abs() < 1e-9, "zero variance is full confidence");
    }

    #[tokio::test]
    async fn alerts_fire_when_condition_holds() {
        let m = monitor();
        m.set_rules(
            "q",
            vec![AlertRule {
                metric: MetricKind::FailureRate,
                comparison: Comparison::Gt,
                threshold: 0.5,
                duration: Duration::ZERO,
                severity: AlertSeverity::Critical,
            }],
        );

        for _ in 0..3 {
            m.observe(&failed("q"));
        }
        m.observe(&completed("q", 50));

        let sample = m.snapshot("q").await.unwrap();
        let fired = m.check_alerts("q", &sample);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].severity, AlertSeverity::Critical);
        assert_eq!(m.active_alerts("q").len(), 1);
    }

    #[tokio::test]
    async fn alerts_wait_for_duration() {
        let m = monitor();
        m.set_rules(
            "q",
            vec![AlertRule {
                metric: MetricKind::FailureRate,
                comparison: Comparison::Gt,
                threshold: 0.5,
                duration: Duration::from_secs(3600),
                severity: AlertSeverity::Warning,
            }],
        );
        m.observe(&failed("q"));

        let sample = m.snapshot("q").await.unwrap();
        assert!(m.check_alerts("q", &sample).is_empty());
    }

    #[tokio::test]
    async fn recovered_condition_resets_pending() {
        let m = monitor();
        m.set_rules(
            "q",
            vec![AlertRule {
                metric: MetricKind::DlqSize,
                comparison: Comparison::Gt,
                threshold: 100.0,
                duration: Duration::from_secs(60),
                severity: AlertSeverity::Warning,
            }],
        );
        let sample = m.snapshot("q").await.unwrap();
        m.check_alerts("q", &sample);
        assert!(m.pending.is_empty(), "condition never held");
    }

    #[tokio::test]
    async fn predictions_scale_by_direction() {
        let m = monitor();
        // Record a few flat samples: stable direction, multiplier 1.0.
        for _ in 0..3 {
            m.observe(&completed("q", 100));
            m.record_sample("q").await.unwrap();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let p = m.predict("q").await.unwrap();
        assert_eq!(p.horizon_hours, 24);
        assert_eq!(p.basis, TrendDirection::Stable);
        assert!(p.throughput_per_hour > 0.0);
    }

    #[test]
    fn multipliers_by_direction() {
        assert!((prediction_multiplier(TrendDirection::Increasing) - 1.2).abs() < 1e-9);
        assert!((prediction_multiplier(TrendDirection::Decreasing) - 0.8).abs() < 1e-9);
        assert!((prediction_multiplier(TrendDirection::Stable) - 1.0).abs() < 1e-9);
    }
}
