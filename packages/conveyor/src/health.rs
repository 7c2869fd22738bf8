//! Queue health scoring and scaling advice.
//!
//! Five checks run per queue against the latest metrics sample: failure
//! rate, average processing time, backlog size, throughput, and DLQ size.
//! The score starts at 100 and loses 10 per warning, 30 per failure.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::QueueError;
use crate::monitor::MetricsSample;
use crate::store::{keys, Store};

/// Health-history retention.
pub const HEALTH_HISTORY_DAYS: i64 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

/// One named check with the observed value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub name: String,
    pub status: CheckStatus,
    pub value: f64,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    /// ≥70 healthy, ≥30 warning, below that critical.
    pub fn from_score(score: u32) -> Self {
        if score >= 70 {
            HealthStatus::Healthy
        } else if score >= 30 {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        }
    }
}

/// Full report for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueHealth {
    pub queue: String,
    pub score: u32,
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Worker-count advice for one queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingAdvice {
    pub queue: String,
    pub current_workers: usize,
    pub suggested_workers: usize,
    pub reason: String,
}

/// Warn/fail boundaries for the five checks.
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub failure_rate_warn: f64,
    pub failure_rate_fail: f64,
    pub processing_ms_warn: u64,
    pub processing_ms_fail: u64,
    pub backlog_warn: u64,
    pub backlog_fail: u64,
    /// Throughput below these values is degraded (only when work waits).
    pub throughput_warn: u64,
    pub throughput_fail: u64,
    pub dlq_warn: u64,
    pub dlq_fail: u64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            failure_rate_warn: 0.05,
            failure_rate_fail: 0.20,
            processing_ms_warn: 30_000,
            processing_ms_fail: 120_000,
            backlog_warn: 50,
            backlog_fail: 200,
            throughput_warn: 10,
            throughput_fail: 1,
            dlq_warn: 10,
            dlq_fail: 100,
        }
    }
}

/// Evaluates queue health and persists reports.
pub struct HealthMonitor {
    store: Arc<dyn Store>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self::with_thresholds(store, HealthThresholds::default())
    }

    pub fn with_thresholds(store: Arc<dyn Store>, thresholds: HealthThresholds) -> Self {
        Self { store, thresholds }
    }

    /// Run the five checks against a sample.
    pub fn evaluate(&self, queue: &str, sample: &MetricsSample) -> QueueHealth {
        let t = &self.thresholds;
        let backlog = sample.counts.backlog();

        let mut checks = Vec::with_capacity(5);

        checks.push(graded(
            "failure_rate",
            sample.failure_rate,
            sample.failure_rate >= t.failure_rate_fail,
            sample.failure_rate >= t.failure_rate_warn,
            format!("failure rate {:.1}%", sample.failure_rate * 100.0),
        ));

        checks.push(graded(
            "avg_processing_time",
            sample.avg_processing_ms as f64,
            sample.avg_processing_ms >= t.processing_ms_fail,
            sample.avg_processing_ms >= t.processing_ms_warn,
            format!("average processing time {} ms", sample.avg_processing_ms),
        ));

        checks.push(graded(
            "backlog",
            backlog as f64,
            backlog >= t.backlog_fail,
            backlog >= t.backlog_warn,
            format!("{backlog} jobs waiting"),
        ));

        // Low throughput only matters while jobs are actually waiting.
        let starved = backlog > 0;
        checks.push(graded(
            "throughput",
            sample.throughput_per_hour as f64,
            starved && sample.throughput_per_hour <= t.throughput_fail,
            starved && sample.throughput_per_hour <= t.throughput_warn,
            format!("{} completions in the last hour", sample.throughput_per_hour),
        ));

        checks.push(graded(
            "dlq_size",
            sample.dlq_size as f64,
            sample.dlq_size >= t.dlq_fail,
            sample.dlq_size >= t.dlq_warn,
            format!("{} dead-lettered jobs", sample.dlq_size),
        ));

        let mut score: i32 = 100;
        for check in &checks {
            score -= match check.status {
                CheckStatus::Pass => 0,
                CheckStatus::Warn => 10,
                CheckStatus::Fail => 30,
            };
        }
        let score = score.clamp(0, 100) as u32;

        QueueHealth {
            queue: queue.to_string(),
            score,
            status: HealthStatus::from_score(score),
            recommendations: recommendations(&checks),
            checks,
            checked_at: sample.ts,
        }
    }

    /// Scaling advice from backlog and the failing checks.
    pub fn scaling_advice(
        &self,
        queue: &str,
        sample: &MetricsSample,
        current_workers: usize,
    ) -> ScalingAdvice {
        let t = &self.thresholds;
        let backlog = sample.counts.backlog();

        let (suggested, reason) = if backlog > 50 {
            // Add two workers, never more than doubling the pool.
            let suggested = (current_workers + 2).min(current_workers.saturating_mul(2).max(2));
            (suggested, format!("backlog of {backlog} jobs"))
        } else if sample.failure_rate >= t.failure_rate_fail
            || sample.avg_processing_ms >= t.processing_ms_fail
        {
            // One more worker, capped at 1.5x the pool.
            let cap = ((current_workers as f64) * 1.5).ceil() as usize;
            let suggested = (current_workers + 1).min(cap.max(current_workers + 1));
            (
                suggested,
                "degraded failure rate or processing time".to_string(),
            )
        } else if backlog < 5 && current_workers > 1 {
            (current_workers - 1, "queue is nearly idle".to_string())
        } else {
            (current_workers, "no change needed".to_string())
        };

        ScalingAdvice {
            queue: queue.to_string(),
            current_workers,
            suggested_workers: suggested,
            reason,
        }
    }

    /// Persist a report and its score into history; prune past retention.
    /// Best-effort: store failures are logged and swallowed.
    pub async fn persist(&self, health: &QueueHealth) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(health)?;
        let result = async {
            self.store
                .hash_set(&keys::health_status(), &health.queue, &encoded)
                .await?;
            let ts = health.checked_at.timestamp_millis();
            let history = keys::health_history(&health.queue);
            self.store
                .zset_add(&history, &format!("{ts}:{}", health.score), ts as f64)
                .await?;
            let cutoff =
                (Utc::now() - chrono::Duration::days(HEALTH_HISTORY_DAYS)).timestamp_millis();
            self.store
                .zset_remove_range_by_score(&history, f64::MIN, cutoff as f64)
                .await?;
            Ok::<_, QueueError>(())
        }
        .await;

        if let Err(e) = result {
            warn!(queue = %health.queue, error = %e, "failed to persist health report");
        }
        Ok(())
    }

    /// Persist a scaling suggestion.
    pub async fn persist_scaling(&self, advice: &ScalingAdvice) -> Result<(), QueueError> {
        let encoded = serde_json::to_string(advice)?;
        if let Err(e) = self
            .store
            .hash_set(&keys::scaling_suggestions(), &advice.queue, &encoded)
            .await
        {
            warn!(queue = %advice.queue, error = %e, "failed to persist scaling advice");
        }
        Ok(())
    }

    /// Latest persisted report for each queue.
    pub async fn all_statuses(&self) -> Result<Vec<QueueHealth>, QueueError> {
        let raw = self.store.hash_get_all(&keys::health_status()).await?;
        let mut reports = Vec::with_capacity(raw.len());
        for (queue, encoded) in raw {
            match serde_json::from_str(&encoded) {
                Ok(report) => reports.push(report),
                Err(e) => warn!(queue = %queue, error = %e, "skipping undecodable health report"),
            }
        }
        Ok(reports)
    }
}

fn graded(
    name: &'static str,
    value: f64,
    failed: bool,
    warned: bool,
    message: String,
) -> HealthCheck {
    let status = if failed {
        CheckStatus::Fail
    } else if warned {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    HealthCheck {
        name: name.to_string(),
        status,
        value,
        message,
    }
}

fn recommendations(checks: &[HealthCheck]) -> Vec<String> {
    let mut recs = Vec::new();
    for check in checks {
        if check.status == CheckStatus::Pass {
            continue;
        }
        let rec = match check.name.as_str() {
            "failure_rate" => "inspect recent failures and the dead-letter queue for a common cause",
            "avg_processing_time" => "profile the processor or raise its deadline",
            "backlog" => "add workers or shed low-priority load",
            "throughput" => "check for stalled workers or an open circuit breaker",
            "dlq_size" => "triage the dead-letter queue and resurrect or purge items",
            _ => continue,
        };
        recs.push(rec.to_string());
    }
    recs
}
