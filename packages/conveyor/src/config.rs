//! Queue configuration.
//!
//! Everything is optional except the queue map: defaults follow the
//! platform conventions (3 attempts, exponential 2 s ×2 capped at 5 min,
//! 30-day metrics and DLQ retention, 7-day health history).

use std::collections::HashMap;
use std::time::Duration;

use crate::retry::Backoff;
use crate::store::StoreConfig;

/// Per-queue execution settings.
#[derive(Debug, Clone)]
pub struct QueueSettings {
    /// Worker pool size. Heavy kinds run 2, moderate 3–4.
    pub concurrency: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self { concurrency: 4 }
    }
}

/// Retention windows for persisted telemetry.
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    pub metrics_days: i64,
    pub dlq_days: i64,
    pub health_history_days: i64,
    /// Completed job records older than this are destroyed.
    pub completed_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            metrics_days: 30,
            dlq_days: 30,
            health_history_days: 7,
            completed_days: 30,
        }
    }
}

/// Top-level configuration for a [`crate::manager::QueueManager`].
#[derive(Debug, Clone)]
pub struct ConveyorConfig {
    pub store: StoreConfig,
    pub queues: HashMap<String, QueueSettings>,
    pub default_max_attempts: u32,
    pub default_backoff: Backoff,
    pub breaker_threshold: u32,
    pub breaker_timeout: Duration,
    pub retention: RetentionConfig,
}

impl Default for ConveyorConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::new("redis://127.0.0.1:6379"),
            queues: HashMap::new(),
            default_max_attempts: 3,
            default_backoff: Backoff::default(),
            breaker_threshold: 5,
            breaker_timeout: Duration::from_secs(60),
            retention: RetentionConfig::default(),
        }
    }
}

impl ConveyorConfig {
    /// Read the store connection from the environment (loading `.env`
    /// first), keeping every other default.
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        Self {
            store: StoreConfig::from_env(),
            ..Default::default()
        }
    }

    /// Add a queue with the given worker count.
    pub fn with_queue(mut self, name: impl Into<String>, concurrency: usize) -> Self {
        self.queues
            .insert(name.into(), QueueSettings { concurrency });
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_platform_conventions() {
        let config = ConveyorConfig::default();
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(
            config.default_backoff,
            Backoff::Exponential {
                delay_ms: 2_000,
                multiplier: 2.0,
                max_delay_ms: 300_000,
            }
        );
        assert_eq!(config.breaker_threshold, 5);
        assert_eq!(config.retention.metrics_days, 30);
        assert_eq!(config.retention.dlq_days, 30);
        assert_eq!(config.retention.health_history_days, 7);
    }

    #[test]
    fn with_queue_registers_settings() {
        let config = ConveyorConfig::default()
            .with_queue("contract-deploy", 2)
            .with_queue("tts", 4);
        assert_eq!(config.queues["contract-deploy"].concurrency, 2);
        assert_eq!(config.queues["tts"].concurrency, 4);
    }
}
