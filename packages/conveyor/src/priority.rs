//! Priority resolution.
//!
//! Maps (kind, payload, tags, parent, system load, staleness) to a priority
//! weight. The pipeline runs in a fixed order; inside each rule group the
//! first match wins:
//!
//! 1. Explicit `metadata.priority`
//! 2. Per-kind baseline from the payload
//! 3. Tag adjustments
//! 4. System-load scaling (snap to the nearest level)
//! 5. Parent inheritance
//! 6. Stale-job escalation for starved LOW jobs

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Discrete priority levels and their weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn weight(&self) -> i32 {
        match self {
            Priority::Low => 1,
            Priority::Normal => 5,
            Priority::High => 10,
            Priority::Critical => 20,
        }
    }

    /// Snap an arbitrary weight to the nearest level; ties round up.
    pub fn from_weight(weight: f64) -> Self {
        let levels = [
            (Priority::Low, 1.0),
            (Priority::Normal, 5.0),
            (Priority::High, 10.0),
            (Priority::Critical, 20.0),
        ];
        let mut best = Priority::Low;
        let mut best_dist = f64::MAX;
        for (level, w) in levels {
            let dist = (weight - w).abs();
            if dist < best_dist || (dist == best_dist && w > best.weight() as f64) {
                best = level;
                best_dist = dist;
            }
        }
        best
    }
}

/// Everything the resolver looks at for one job.
#[derive(Debug, Clone)]
pub struct PriorityContext<'a> {
    pub kind: &'a str,
    pub payload: &'a serde_json::Value,
    pub metadata: &'a serde_json::Value,
    pub tags: &'a [String],
    pub parent_id: Option<&'a str>,
    pub enqueued_at: DateTime<Utc>,
}

/// Per-kind staleness threshold before a starved LOW job is bumped.
fn staleness_threshold(kind: &str) -> Option<Duration> {
    match kind {
        "contract-deploy" => Some(Duration::from_secs(30 * 60)),
        "tts" => Some(Duration::from_secs(5 * 60)),
        "news-index" => Some(Duration::from_secs(10 * 60)),
        _ => None,
    }
}

/// Resolves priorities. System load is shared mutable state updated by the
/// monitor; it scales weights in `[0.5, 2.0]`.
pub struct PriorityResolver {
    /// Load factor stored as bits so updates need no lock.
    load_bits: AtomicU64,
}

impl Default for PriorityResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl PriorityResolver {
    pub fn new() -> Self {
        Self {
            load_bits: AtomicU64::new(1.0f64.to_bits()),
        }
    }

    pub fn set_system_load(&self, factor: f64) {
        let clamped = factor.clamp(0.5, 2.0);
        self.load_bits.store(clamped.to_bits(), Ordering::Relaxed);
    }

    pub fn system_load(&self) -> f64 {
        f64::from_bits(self.load_bits.load(Ordering::Relaxed))
    }

    /// Resolve the priority weight for a job.
    pub fn resolve(&self, ctx: &PriorityContext<'_>) -> i32 {
        self.resolve_level(ctx, Utc::now()).weight()
    }

    /// Resolve with an explicit clock, for staleness checks.
    pub fn resolve_level(&self, ctx: &PriorityContext<'_>, now: DateTime<Utc>) -> Priority {
        // 1. Explicit metadata.priority wins outright.
        if let Some(p) = explicit_priority(ctx.metadata) {
            return p;
        }

        // 2. Per-kind baseline.
        let mut level = kind_baseline(ctx.kind, ctx.payload, now);

        // 3. Tag adjustments.
        if let Some(tagged) = tag_adjustment(ctx.tags) {
            level = tagged;
        }

        // 4. System load scales the weight, then snaps back to a level.
        let load = self.system_load();
        if (load - 1.0).abs() > f64::EPSILON {
            level = Priority::from_weight(level.weight() as f64 * load);
        }

        // 5. Parent inheritance escalates to at least HIGH.
        if let Some(parent) = ctx.parent_id {
            let parent = parent.to_lowercase();
            if (parent.contains("high") || parent.contains("critical")) && level < Priority::High {
                level = Priority::High;
            }
        }

        // 6. Stale LOW jobs get bumped to NORMAL.
        if level == Priority::Low {
            if let Some(threshold) = staleness_threshold(ctx.kind) {
                let age = now - ctx.enqueued_at;
                if age.to_std().map(|a| a > threshold).unwrap_or(false) {
                    level = Priority::Normal;
                }
            }
        }

        level
    }
}

fn explicit_priority(metadata: &serde_json::Value) -> Option<Priority> {
    match metadata.get("priority")? {
        serde_json::Value::String(s) => match s.to_lowercase().as_str() {
            "low" => Some(Priority::Low),
            "normal" => Some(Priority::Normal),
            "high" => Some(Priority::High),
            "critical" => Some(Priority::Critical),
            _ => None,
        },
        serde_json::Value::Number(n) => {
            n.as_f64().map(Priority::from_weight)
        }
        _ => None,
    }
}

fn kind_baseline(kind: &str, payload: &serde_json::Value, now: DateTime<Utc>) -> Priority {
    match kind {
        "contract-deploy" => {
            match payload.get("environment").and_then(|v| v.as_str()) {
                Some("production") => Priority::Critical,
                Some("staging") => Priority::Normal,
                _ if payload.get("urgent").and_then(|v| v.as_bool()) == Some(true) => {
                    Priority::High
                }
                _ => Priority::Low,
            }
        }
        "tts" => {
            let session = payload.get("session_type").and_then(|v| v.as_str());
            if session == Some("realtime") {
                return Priority::High;
            }
            let text_len = payload
                .get("text")
                .and_then(|v| v.as_str())
                .map(|t| t.chars().count())
                .unwrap_or(0);
            let batch = payload.get("batch").and_then(|v| v.as_bool()) == Some(true);
            // Short texts and mid-length texts both land on NORMAL; only
            // batch work or very long texts drop to LOW.
            if batch || text_len > 1000 {
                Priority::Low
            } else {
                Priority::Normal
            }
        }
        "news-index" => {
            let breaking = payload.get("breaking").and_then(|v| v.as_bool()) == Some(true)
                || payload.get("urgent").and_then(|v| v.as_bool()) == Some(true);
            if breaking {
                return Priority::Critical;
            }
            let fresh = payload
                .get("published_at")
                .and_then(|v| v.as_str())
                .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                .map(|ts| now.signed_duration_since(ts.with_timezone(&Utc))
                    < chrono::Duration::minutes(5))
                .unwrap_or(false);
            if fresh {
                Priority::High
            } else {
                Priority::Normal
            }
        }
        _ => Priority::Normal,
    }
}

fn tag_adjustment(tags: &[String]) -> Option<Priority> {
    const CRITICAL: [&str; 3] = ["emergency", "security", "compliance"];
    const HIGH: [&str; 5] = ["urgent", "critical", "real-time", "production", "breaking"];
    const LOW: [&str; 5] = ["batch", "bulk", "test", "development", "low-priority"];

    let has = |set: &[&str]| tags.iter().any(|t| set.contains(&t.to_lowercase().as_str()));

    if has(&CRITICAL) {
        Some(Priority::Critical)
    } else if has(&HIGH) {
        Some(Priority::High)
    } else if has(&LOW) {
        Some(Priority::Low)
    } else {
        None
    }
}
