//! Retry policy: backoff computation, error classification, and the
//! per-queue circuit breaker.
//!
//! Backoff and classification are pure; the breaker is the only stateful
//! piece, and its state is in-process. Single-leader assumption: promote
//! it to the store before running multiple instances.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};

// ============================================================================
// Backoff
// ============================================================================

/// How long to wait before attempt `a + 1` after attempt `a` failed.
///
/// `Custom` names a pure function registered in a [`CustomBackoffRegistry`];
/// the record itself stays serializable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum Backoff {
    Exponential {
        delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
    Fixed {
        delay_ms: u64,
    },
    Linear {
        delay_ms: u64,
        max_delay_ms: u64,
    },
    Fibonacci {
        delay_ms: u64,
        max_delay_ms: u64,
    },
    /// Exponential with up to +10% random spread.
    Jitter {
        delay_ms: u64,
        multiplier: f64,
        max_delay_ms: u64,
    },
    Custom {
        name: String,
    },
}

impl Default for Backoff {
    /// Exponential, 2 s base, ×2, capped at 5 min.
    fn default() -> Self {
        Backoff::Exponential {
            delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        }
    }
}

/// `fib(1) = fib(2) = 1`, saturating.
fn fib(n: u32) -> u64 {
    let (mut a, mut b): (u64, u64) = (1, 1);
    for _ in 2..n.max(1) {
        let next = a.saturating_add(b);
        a = b;
        b = next;
    }
    if n <= 1 { 1 } else { b }
}

impl Backoff {
    /// Delay before the next attempt, given that attempt `attempt` (1-based)
    /// just failed. Returns `None` for `Custom`; resolve those through a
    /// [`CustomBackoffRegistry`].
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let attempt = attempt.max(1);
        let ms = match self {
            Backoff::Exponential {
                delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                let raw = *delay_ms as f64 * multiplier.powi(attempt as i32 - 1);
                (raw as u64).min(*max_delay_ms)
            }
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Linear {
                delay_ms,
                max_delay_ms,
            } => delay_ms.saturating_mul(attempt as u64).min(*max_delay_ms),
            Backoff::Fibonacci {
                delay_ms,
                max_delay_ms,
            } => fib(attempt).saturating_mul(*delay_ms).min(*max_delay_ms),
            Backoff::Jitter {
                delay_ms,
                multiplier,
                max_delay_ms,
            } => {
                let raw = *delay_ms as f64 * multiplier.powi(attempt as i32 - 1);
                let capped = raw.min(*max_delay_ms as f64);
                let spread: f64 = rand::thread_rng().gen_range(0.0..1.0);
                (capped * (1.0 + spread * 0.1)) as u64
            }
            Backoff::Custom { .. } => return None,
        };
        Some(Duration::from_millis(ms))
    }
}

/// A caller-supplied pure backoff function of the attempt number.
pub type CustomBackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Registry of named custom backoff functions.
#[derive(Default)]
pub struct CustomBackoffRegistry {
    fns: DashMap<String, CustomBackoffFn>,
}

impl CustomBackoffRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, f: CustomBackoffFn) {
        self.fns.insert(name.into(), f);
    }

    /// Resolve a backoff to a concrete delay. Unknown custom names fall back
    /// to the default exponential policy.
    pub fn resolve(&self, backoff: &Backoff, attempt: u32) -> Duration {
        match backoff {
            Backoff::Custom { name } => match self.fns.get(name) {
                Some(f) => f(attempt),
                None => {
                    tracing::warn!(name = %name, "unknown custom backoff, using default");
                    Backoff::default()
                        .next_delay(attempt)
                        .unwrap_or(Duration::from_secs(2))
                }
            },
            other => other
                .next_delay(attempt)
                .unwrap_or(Duration::from_secs(2)),
        }
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Dead-letter category for a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCategory {
    NetworkError,
    TimeoutError,
    ValidationError,
    ResourceError,
    PermissionError,
    UnknownError,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NetworkError => "network-error",
            ErrorCategory::TimeoutError => "timeout-error",
            ErrorCategory::ValidationError => "validation-error",
            ErrorCategory::ResourceError => "resource-error",
            ErrorCategory::PermissionError => "permission-error",
            ErrorCategory::UnknownError => "unknown-error",
        }
    }

    pub const ALL: [ErrorCategory; 6] = [
        ErrorCategory::NetworkError,
        ErrorCategory::TimeoutError,
        ErrorCategory::ValidationError,
        ErrorCategory::ResourceError,
        ErrorCategory::PermissionError,
        ErrorCategory::UnknownError,
    ];
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Never retry; dead-letter immediately with `can_retry = false`.
    Permanent,
    /// Retry per the job's backoff.
    Transient,
    /// Needs a second look at the message before deciding.
    Conditional,
}

/// Classify an error message by substring heuristics on canonical tokens.
///
/// The order mirrors the token table: timeout, connection/network, rate
/// limits, validation, authorization, server errors, database.
pub fn classify(message: &str) -> (ErrorCategory, ErrorClass) {
    let msg = message.to_lowercase();

    if msg.contains("timeout") || msg.contains("etimedout") {
        return (ErrorCategory::TimeoutError, ErrorClass::Transient);
    }
    if msg.contains("econn") || msg.contains("network") {
        return (ErrorCategory::NetworkError, ErrorClass::Transient);
    }
    if msg.contains("rate") || msg.contains("limit") {
        return (ErrorCategory::ResourceError, ErrorClass::Transient);
    }
    if msg.contains("validat") || msg.contains("invalid") {
        return (ErrorCategory::ValidationError, ErrorClass::Permanent);
    }
    if msg.contains("auth") || msg.contains("unauthorized") || msg.contains("permission") {
        return (ErrorCategory::PermissionError, ErrorClass::Permanent);
    }
    if msg.contains("server error")
        || msg.contains("500")
        || msg.contains("502")
        || msg.contains("503")
        || msg.contains("504")
    {
        return (ErrorCategory::NetworkError, ErrorClass::Transient);
    }
    if msg.contains("database") || msg.contains("external service") {
        return (ErrorCategory::ResourceError, ErrorClass::Conditional);
    }

    (ErrorCategory::UnknownError, ErrorClass::Transient)
}

/// Resolve a conditional classification: transient iff the message carries a
/// known transient token, permanent otherwise.
pub fn resolve_conditional(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();
    const TRANSIENT_TOKENS: [&str; 5] =
        ["econn", "etimedout", "timeout", "network", "connection"];
    if TRANSIENT_TOKENS.iter().any(|t| msg.contains(t)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

/// Classify and fold conditional results into a final permanent/transient
/// verdict.
pub fn classify_final(message: &str) -> (ErrorCategory, ErrorClass) {
    let (category, class) = classify(message);
    match class {
        ErrorClass::Conditional => (category, resolve_conditional(message)),
        other => (category, other),
    }
}

// ============================================================================
// Circuit breaker
// ============================================================================

/// Breaker mode for a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerMode {
    Closed,
    Open,
    HalfOpen,
}

/// What the worker should do with the next job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerDecision {
    /// Run the job normally.
    Allow,
    /// Run the job as the single half-open probe.
    Probe,
    /// Do not run; the breaker is open and its cooldown has not elapsed.
    Reject,
}

#[derive(Debug, Clone)]
struct BreakerState {
    mode: BreakerMode,
    consecutive_failures: u32,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            mode: BreakerMode::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

/// Per-queue circuit breakers.
///
/// Closed → Open at `threshold` consecutive failures; Open → HalfOpen once
/// `timeout` has elapsed; HalfOpen admits exactly one probe. A successful
/// probe closes the breaker and zeroes the counter, a failure reopens it.
pub struct CircuitBreakers {
    threshold: u32,
    timeout: Duration,
    states: DashMap<String, BreakerState>,
}

impl CircuitBreakers {
    pub fn new(threshold: u32, timeout: Duration) -> Self {
        Self {
            threshold,
            timeout,
            states: DashMap::new(),
        }
    }

    /// Decide whether the next job on `queue` may run.
    pub fn check(&self, queue: &str) -> BreakerDecision {
        let mut state = self.states.entry(queue.to_string()).or_default();
        match state.mode {
            BreakerMode::Closed => BreakerDecision::Allow,
            BreakerMode::Open => {
                let elapsed = state
                    .last_failure_at
                    .map(|at| Utc::now() - at >= chrono::Duration::from_std(self.timeout)
                        .unwrap_or_else(|_| chrono::Duration::seconds(60)))
                    .unwrap_or(true);
                if elapsed {
                    state.mode = BreakerMode::HalfOpen;
                    state.probe_in_flight = true;
                    tracing::info!(queue = %queue, "circuit breaker half-open, admitting probe");
                    BreakerDecision::Probe
                } else {
                    BreakerDecision::Reject
                }
            }
            BreakerMode::HalfOpen => {
                if state.probe_in_flight {
                    BreakerDecision::Reject
                } else {
                    state.probe_in_flight = true;
                    BreakerDecision::Probe
                }
            }
        }
    }

    /// Record a successful execution.
    pub fn record_success(&self, queue: &str) {
        let mut state = self.states.entry(queue.to_string()).or_default();
        if state.mode != BreakerMode::Closed {
            tracing::info!(queue = %queue, "circuit breaker closed");
        }
        *state = BreakerState::default();
    }

    /// Record a failed execution.
    pub fn record_failure(&self, queue: &str) {
        let mut state = self.states.entry(queue.to_string()).or_default();
        state.consecutive_failures += 1;
        state.last_failure_at = Some(Utc::now());
        state.probe_in_flight = false;
        match state.mode {
            BreakerMode::Closed if state.consecutive_failures >= self.threshold => {
                state.mode = BreakerMode::Open;
                tracing::warn!(
                    queue = %queue,
                    failures = state.consecutive_failures,
                    "circuit breaker opened"
                );
            }
            BreakerMode::HalfOpen => {
                state.mode = BreakerMode::Open;
                tracing::warn!(queue = %queue, "probe failed, circuit breaker reopened");
            }
            _ => {}
        }
    }

    /// Current mode for a queue (Closed when never seen).
    pub fn mode(&self, queue: &str) -> BreakerMode {
        self.states
            .get(queue)
            .map(|s| s.mode)
            .unwrap_or(BreakerMode::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            delay_ms: 2_000,
            multiplier: 2.0,
            max_delay_ms: 300_000,
        };
        assert_eq!(backoff.next_delay(1), Some(Duration::from_secs(2)));
        assert_eq!(backoff.next_delay(2), Some(Duration::from_secs(4)));
        assert_eq!(backoff.next_delay(3), Some(Duration::from_secs(8)));
        // Far past the cap
        assert_eq!(backoff.next_delay(20), Some(Duration::from_secs(300)));
    }

    #[test]
    fn exponential_delay_is_monotonic_up_to_cap() {
        let backoff = Backoff::Exponential {
            delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        };
        let mut last = Duration::ZERO;
        for attempt in 1..=12 {
            let d = backoff.next_delay(attempt).unwrap();
            assert!(d >= last, "delay shrank at attempt {attempt}");
            assert!(d <= Duration::from_secs(60));
            last = d;
        }
    }

    #[test]
    fn fixed_is_constant() {
        let backoff = Backoff::Fixed { delay_ms: 1_500 };
        assert_eq!(backoff.next_delay(1), backoff.next_delay(7));
    }

    #[test]
    fn linear_scales_with_attempt() {
        let backoff = Backoff::Linear {
            delay_ms: 1_000,
            max_delay_ms: 3_500,
        };
        assert_eq!(backoff.next_delay(1), Some(Duration::from_secs(1)));
        assert_eq!(backoff.next_delay(3), Some(Duration::from_secs(3)));
        assert_eq!(backoff.next_delay(10), Some(Duration::from_millis(3_500)));
    }

    #[test]
    fn fibonacci_sequence() {
        let backoff = Backoff::Fibonacci {
            delay_ms: 1_000,
            max_delay_ms: 100_000,
        };
        let expected = [1u64, 1, 2, 3, 5, 8, 13];
        for (i, f) in expected.iter().enumerate() {
            assert_eq!(
                backoff.next_delay(i as u32 + 1),
                Some(Duration::from_millis(f * 1_000))
            );
        }
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let backoff = Backoff::Jitter {
            delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
        };
        for _ in 0..50 {
            let d = backoff.next_delay(2).unwrap();
            assert!(d >= Duration::from_millis(2_000));
            assert!(d < Duration::from_millis(2_200));
        }
    }

    #[test]
    fn custom_resolves_through_registry() {
        let registry = CustomBackoffRegistry::new();
        registry.register(
            "steps-of-ten",
            Arc::new(|attempt| Duration::from_millis(attempt as u64 * 10)),
        );
        let backoff = Backoff::Custom {
            name: "steps-of-ten".to_string(),
        };
        assert_eq!(registry.resolve(&backoff, 3), Duration::from_millis(30));

        let unknown = Backoff::Custom {
            name: "nope".to_string(),
        };
        assert_eq!(registry.resolve(&unknown, 1), Duration::from_secs(2));
    }

    #[test]
    fn classification_table() {
        use ErrorCategory::*;
        use ErrorClass::*;
        let cases = [
            ("connect ETIMEDOUT 10.0.0.1:443", TimeoutError, Transient),
            ("request timeout after 30s", TimeoutError, Transient),
            ("ECONNREFUSED", NetworkError, Transient),
            ("network unreachable", NetworkError, Transient),
            ("rate limit exceeded", ResourceError, Transient),
            ("validation failed: missing field", ValidationError, Permanent),
            ("invalid payload shape", ValidationError, Permanent),
            ("unauthorized: bad token", PermissionError, Permanent),
            ("upstream 503 server error", NetworkError, Transient),
            ("totally novel explosion", UnknownError, Transient),
        ];
        for (msg, category, class) in cases {
            assert_eq!(classify(msg), (category, class), "message: {msg}");
        }
    }

    #[test]
    fn conditional_database_errors_resolve_by_token() {
        let (category, class) = classify("database connection lost");
        assert_eq!(category, ErrorCategory::ResourceError);
        assert_eq!(class, ErrorClass::Conditional);
        assert_eq!(
            classify_final("database connection lost").1,
            ErrorClass::Transient
        );
        assert_eq!(
            classify_final("database constraint violated on insert").1,
            ErrorClass::Permanent
        );
    }

    #[test]
    fn breaker_opens_after_threshold() {
        let breakers = CircuitBreakers::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            breakers.record_failure("q");
            assert_eq!(breakers.mode("q"), BreakerMode::Closed);
        }
        breakers.record_failure("q");
        assert_eq!(breakers.mode("q"), BreakerMode::Open);
        assert_eq!(breakers.check("q"), BreakerDecision::Reject);
    }

    #[test]
    fn breaker_success_resets_counter() {
        let breakers = CircuitBreakers::new(5, Duration::from_secs(30));
        for _ in 0..4 {
            breakers.record_failure("q");
        }
        breakers.record_success("q");
        for _ in 0..4 {
            breakers.record_failure("q");
        }
        assert_eq!(breakers.mode("q"), BreakerMode::Closed);
    }

    #[test]
    fn breaker_half_open_admits_single_probe() {
        let breakers = CircuitBreakers::new(2, Duration::from_millis(0));
        breakers.record_failure("q");
        breakers.record_failure("q");
        assert_eq!(breakers.mode("q"), BreakerMode::Open);

        // Cooldown of zero: first check transitions to half-open and admits
        // one probe; the next is rejected while the probe is in flight.
        assert_eq!(breakers.check("q"), BreakerDecision::Probe);
        assert_eq!(breakers.check("q"), BreakerDecision::Reject);

        breakers.record_success("q");
        assert_eq!(breakers.mode("q"), BreakerMode::Closed);
        assert_eq!(breakers.check("q"), BreakerDecision::Allow);
    }

    #[test]
    fn breaker_probe_failure_reopens() {
        let breakers = CircuitBreakers::new(2, Duration::from_millis(0));
        breakers.record_failure("q");
        breakers.record_failure("q");
        assert_eq!(breakers.check("q"), BreakerDecision::Probe);
        breakers.record_failure("q");
        assert_eq!(breakers.mode("q"), BreakerMode::Open);
    }

    #[test]
    fn breakers_are_independent_per_queue() {
        let breakers = CircuitBreakers::new(1, Duration::from_secs(30));
        breakers.record_failure("a");
        assert_eq!(breakers.mode("a"), BreakerMode::Open);
        assert_eq!(breakers.mode("b"), BreakerMode::Closed);
        assert_eq!(breakers.check("b"), BreakerDecision::Allow);
    }
}
