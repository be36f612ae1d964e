//! Keyed token-bucket rate limiting

use std::num::NonZeroU32;

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::{Quota, RateLimiter as GovernorLimiter};

use crate::config::RateLimitConfig;

type KeyedLimiter = GovernorLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Outcome of one admission check
#[derive(Debug, Clone, Copy)]
pub struct RateDecision {
    /// Whether the request may proceed
    pub allowed: bool,
    /// Configured requests-per-second limit
    pub limit: u32,
    /// Milliseconds until a permit becomes available (0 when allowed)
    pub retry_after_ms: u64,
}

/// Token bucket per key (`global`, `op`, `op:provider_id`, ...).
///
/// Bucket state is sharded per key inside governor's dashmap-backed store,
/// so the hot path takes no global lock.
pub struct RateLimiter {
    enabled: bool,
    limiter: KeyedLimiter,
    clock: DefaultClock,
    limit: u32,
}

impl RateLimiter {
    /// Create a limiter from configuration
    #[must_use]
    pub fn new(config: &RateLimitConfig) -> Self {
        let rps = NonZeroU32::new(config.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_second(rps).allow_burst(burst);
        Self {
            enabled: config.enabled,
            limiter: GovernorLimiter::keyed(quota),
            clock: DefaultClock::default(),
            limit: config.requests_per_second,
        }
    }

    /// Try to consume one permit for `key`
    pub fn consume(&self, key: &str) -> RateDecision {
        if !self.enabled {
            return RateDecision {
                allowed: true,
                limit: self.limit,
                retry_after_ms: 0,
            };
        }

        match self.limiter.check_key(&key.to_string()) {
            Ok(()) => RateDecision {
                allowed: true,
                limit: self.limit,
                retry_after_ms: 0,
            },
            Err(not_until) => {
                #[allow(clippy::cast_possible_truncation)]
                let retry_after_ms =
                    not_until.wait_time_from(self.clock.now()).as_millis() as u64;
                RateDecision {
                    allowed: false,
                    limit: self.limit,
                    retry_after_ms,
                }
            }
        }
    }
}
