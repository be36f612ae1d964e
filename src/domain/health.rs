//! Per-provider health tracking with exponential retry backoff

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;

/// Backoff ceiling; operators reason in wall-clock, so the clock here is
/// deliberately wall-clock too.
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Tracks failure streaks, lifetime totals and the retry backoff clock for
/// one provider. Pure in-memory state; always mutated under the owning
/// provider's lock.
#[derive(Debug, Clone)]
pub struct HealthTracker {
    max_consecutive_failures: u32,
    consecutive_failures: u32,
    last_success_at: Option<f64>,
    last_failure_at: Option<f64>,
    total_invocations: u64,
    total_failures: u64,
}

impl HealthTracker {
    /// Create a tracker that degrades after `max_consecutive_failures`
    #[must_use]
    pub fn new(max_consecutive_failures: u32) -> Self {
        Self {
            max_consecutive_failures,
            consecutive_failures: 0,
            last_success_at: None,
            last_failure_at: None,
            total_invocations: 0,
            total_failures: 0,
        }
    }

    fn now_epoch() -> f64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    }

    /// Record a successful operation: the failure streak resets
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_success_at = Some(Self::now_epoch());
        self.total_invocations += 1;
    }

    /// Record an infrastructure failure: counts toward the streak
    pub fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        self.last_failure_at = Some(Self::now_epoch());
        self.total_failures += 1;
        self.total_invocations += 1;
    }

    /// Record a user-caused invocation failure (bad arguments, provider
    /// domain error): counts toward totals but not toward the streak, so a
    /// misbehaving caller cannot degrade a healthy provider.
    pub fn record_invocation_failure(&mut self) {
        self.total_failures += 1;
        self.total_invocations += 1;
    }

    /// Whether the failure streak has reached the degradation threshold
    #[must_use]
    pub fn should_degrade(&self) -> bool {
        self.consecutive_failures >= self.max_consecutive_failures
    }

    /// Backoff for the current streak: `min(60s, 2^consecutive)`
    fn backoff(&self) -> Duration {
        let exp = 2f64.powi(i32::try_from(self.consecutive_failures).unwrap_or(i32::MAX));
        Duration::from_secs_f64(exp).min(MAX_BACKOFF)
    }

    /// Whether enough wall-clock time has passed for a retry attempt
    #[must_use]
    pub fn can_retry(&self) -> bool {
        let Some(last_failure) = self.last_failure_at else {
            return true;
        };
        Self::now_epoch() - last_failure >= self.backoff().as_secs_f64()
    }

    /// Time remaining until a retry is allowed; zero when already allowed
    #[must_use]
    pub fn time_until_retry(&self) -> Duration {
        let Some(last_failure) = self.last_failure_at else {
            return Duration::ZERO;
        };
        let elapsed = Self::now_epoch() - last_failure;
        let remaining = self.backoff().as_secs_f64() - elapsed;
        if remaining <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(remaining)
        }
    }

    /// Current consecutive failure count
    #[must_use]
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Lifetime invocation count (successes + failures)
    #[must_use]
    pub fn total_invocations(&self) -> u64 {
        self.total_invocations
    }

    /// Lifetime failure count
    #[must_use]
    pub fn total_failures(&self) -> u64 {
        self.total_failures
    }

    /// Success rate in [0.0, 1.0]; 1.0 before any invocation
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        if self.total_invocations == 0 {
            return 1.0;
        }
        (self.total_invocations - self.total_failures) as f64 / self.total_invocations as f64
    }

    /// Reset to initial state
    pub fn reset(&mut self) {
        self.consecutive_failures = 0;
        self.last_success_at = None;
        self.last_failure_at = None;
        self.total_invocations = 0;
        self.total_failures = 0;
    }

    /// Serializable snapshot for listings and details
    #[must_use]
    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            consecutive_failures: self.consecutive_failures,
            last_success_at: self.last_success_at,
            last_failure_at: self.last_failure_at,
            total_invocations: self.total_invocations,
            total_failures: self.total_failures,
            success_rate: self.success_rate(),
            can_retry: self.can_retry(),
            time_until_retry_s: self.time_until_retry().as_secs_f64(),
        }
    }
}

/// Point-in-time health metrics, cheap to clone
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Current failure streak
    pub consecutive_failures: u32,
    /// Epoch seconds of last success
    pub last_success_at: Option<f64>,
    /// Epoch seconds of last failure
    pub last_failure_at: Option<f64>,
    /// Lifetime invocations
    pub total_invocations: u64,
    /// Lifetime failures
    pub total_failures: u64,
    /// Success rate in [0.0, 1.0]
    pub success_rate: f64,
    /// Whether the backoff window has elapsed
    pub can_retry: bool,
    /// Seconds until retry is allowed
    pub time_until_retry_s: f64,
}
