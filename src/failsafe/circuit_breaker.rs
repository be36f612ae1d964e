//! Per-member circuit breaker

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::CircuitBreakerConfig;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Allowing requests
    Closed,
    /// Blocking requests until the reset timeout elapses
    Open,
    /// Admitting exactly one probe request
    HalfOpen,
}

impl CircuitState {
    /// Lowercase label used in status payloads
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Three-state failure gate protecting one group member.
///
/// Opens after `failure_threshold` consecutive failures; after
/// `reset_timeout` of wall clock it admits a single probe. One probe
/// success closes the circuit, one failure reopens it with a fresh timer.
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    state: RwLock<CircuitState>,
    failures: AtomicU32,
    /// Epoch-ms of the last state change (drives OPEN -> HALF_OPEN)
    last_state_change: AtomicU64,
    /// Gate ensuring half-open admits one probe at a time
    probe_in_flight: AtomicBool,
}

impl CircuitBreaker {
    /// Create a breaker for the named member
    #[must_use]
    pub fn new(name: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            failure_threshold: config.failure_threshold,
            reset_timeout: config.reset_timeout,
            state: RwLock::new(CircuitState::Closed),
            failures: AtomicU32::new(0),
            last_state_change: AtomicU64::new(0),
            probe_in_flight: AtomicBool::new(false),
        }
    }

    /// Whether a request may proceed through this member.
    ///
    /// In `Open`, checks the reset timeout against wall-clock epoch-ms and
    /// moves to `HalfOpen` when it has elapsed. In `HalfOpen`, only the
    /// first caller wins the probe slot.
    pub fn can_proceed(&self) -> bool {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed_ms =
                    epoch_millis_now().saturating_sub(self.last_state_change.load(Ordering::Relaxed));
                #[allow(clippy::cast_possible_truncation)]
                let timeout_ms = self.reset_timeout.as_millis() as u64;
                if elapsed_ms >= timeout_ms {
                    debug!(member = %self.name, "reset timeout elapsed, transitioning to half-open");
                    self.transition_to(CircuitState::HalfOpen);
                    self.probe_in_flight
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok()
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self
                .probe_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok(),
        }
    }

    /// Record a successful request
    pub fn record_success(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
            }
            CircuitState::HalfOpen => {
                // One probe success closes the circuit.
                self.transition_to(CircuitState::Closed);
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed request
    pub fn record_failure(&self) {
        let state = *self.state.read();
        match state {
            CircuitState::Closed => {
                let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
                if failures >= self.failure_threshold {
                    self.transition_to(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                // The probe failed; reopen with a fresh timer.
                self.transition_to(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> CircuitState {
        *self.state.read()
    }

    /// Milliseconds until the next probe is allowed; zero unless Open
    #[must_use]
    pub fn retry_after_ms(&self) -> u64 {
        if *self.state.read() != CircuitState::Open {
            return 0;
        }
        let elapsed_ms =
            epoch_millis_now().saturating_sub(self.last_state_change.load(Ordering::Relaxed));
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = self.reset_timeout.as_millis() as u64;
        timeout_ms.saturating_sub(elapsed_ms)
    }

    fn transition_to(&self, new_state: CircuitState) {
        let mut state = self.state.write();
        let old_state = *state;
        if old_state == new_state {
            return;
        }
        *state = new_state;
        self.last_state_change
            .store(epoch_millis_now(), Ordering::Relaxed);
        self.probe_in_flight.store(false, Ordering::SeqCst);

        match new_state {
            CircuitState::Closed => {
                self.failures.store(0, Ordering::Relaxed);
                info!(member = %self.name, "circuit breaker closed");
            }
            CircuitState::Open => {
                warn!(
                    member = %self.name,
                    failures = self.failures.load(Ordering::Relaxed),
                    "circuit breaker opened"
                );
            }
            CircuitState::HalfOpen => {
                debug!(member = %self.name, "circuit breaker half-open");
            }
        }
    }
}

/// Current time as milliseconds since UNIX epoch
#[allow(clippy::cast_possible_truncation)]
fn epoch_millis_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, reset_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig {
            failure_threshold,
            reset_timeout,
        }
    }

    #[test]
    fn starts_closed_and_allows_requests() {
        let cb = CircuitBreaker::new("m1", &config(3, Duration::from_secs(30)));
        assert!(cb.can_proceed());
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.retry_after_ms(), 0);
    }

    #[test]
    fn opens_at_the_failure_threshold() {
        let cb = CircuitBreaker::new("m1", &config(3, Duration::from_secs(30)));
        cb.record_failure();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.can_proceed());
        assert!(cb.retry_after_ms() > 0);
    }

    #[test]
    fn success_in_closed_resets_the_streak() {
        let cb = CircuitBreaker::new("m1", &config(3, Duration::from_secs(30)));
        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();
        // 2 + reset + 2 never reaches the threshold of 3.
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_admits_exactly_one_probe() {
        // Zero reset timeout: the next can_proceed moves straight to half-open.
        let cb = CircuitBreaker::new("m1", &config(1, Duration::ZERO));
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // GIVEN: the reset timeout has elapsed
        // WHEN: two callers race for the probe slot
        assert!(cb.can_proceed(), "first caller wins the probe");
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.can_proceed(), "second caller is refused");

        // THEN: the probe outcome decides the circuit
        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.can_proceed());
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = CircuitBreaker::new("m1", &config(1, Duration::ZERO));
        cb.record_failure();
        assert!(cb.can_proceed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn state_labels() {
        assert_eq!(CircuitState::Closed.as_str(), "closed");
        assert_eq!(CircuitState::Open.as_str(), "open");
        assert_eq!(CircuitState::HalfOpen.as_str(), "half_open");
    }
}
