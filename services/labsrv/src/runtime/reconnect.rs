//! Automatic reconnection policy
//!
//! Exponential backoff without jitter: the retry scheduled for attempt `k`
//! (0-indexed) waits `min(max_delay, initial_delay * multiplier^k)`. Once
//! `max_attempts` retries have been scheduled the next failure exhausts the
//! policy and the connection goes dormant.

use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Retries scheduled before a connection goes dormant
pub const MAX_RECONNECT_ATTEMPTS: u32 = 10;

/// Reconnection policy configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Retries scheduled before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any delay
    pub max_delay: Duration,
    /// Backoff multiplier for exponential delay
    pub backoff_multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay for the retry with 0-indexed `attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.checked_pow(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

/// What to do after a transport failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Reconnect after `delay`; `attempt` is the 1-based retry number
    Retry { attempt: u32, delay: Duration },
    /// Stop retrying until a manual reconnect
    Exhausted,
}

/// Reconnection context tracking current state and attempts
#[derive(Debug, Clone, Default)]
pub struct ReconnectContext {
    /// Retries scheduled since the last successful connect
    pub current_attempt: u32,
    pub last_failure: Option<Instant>,
    pub next_attempt: Option<Instant>,
}

/// Reconnection statistics tracking
#[derive(Debug, Default, Clone)]
pub struct ReconnectStats {
    pub total_failures: u64,
    pub scheduled_retries: u64,
    pub exhausted: u64,
    pub successful_connects: u64,
    pub last_connected: Option<Instant>,
}

/// Attempt counter plus backoff decisions for one identity key
#[derive(Debug)]
pub struct ReconnectHelper {
    policy: ReconnectPolicy,
    context: ReconnectContext,
    stats: ReconnectStats,
}

impl ReconnectHelper {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            context: ReconnectContext::default(),
            stats: ReconnectStats::default(),
        }
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    pub fn current_attempt(&self) -> u32 {
        self.context.current_attempt
    }

    pub fn stats(&self) -> &ReconnectStats {
        &self.stats
    }

    /// Reset the counter (manual reconnect)
    pub fn reset(&mut self) {
        self.context.current_attempt = 0;
        self.context.next_attempt = None;
    }

    /// Mark the connection as successful
    pub fn mark_connected(&mut self) {
        self.context.current_attempt = 0;
        self.context.next_attempt = None;
        self.stats.successful_connects += 1;
        self.stats.last_connected = Some(Instant::now());
        debug!("Connection marked as successful");
    }

    /// Record a failure and decide whether to retry
    pub fn on_failure(&mut self) -> RetryDecision {
        let now = Instant::now();
        self.stats.total_failures += 1;
        self.context.last_failure = Some(now);

        if self.context.current_attempt >= self.policy.max_attempts {
            warn!(
                "Maximum reconnection attempts ({}) exceeded, connection dormant",
                self.policy.max_attempts
            );
            self.context.current_attempt = 0;
            self.context.next_attempt = None;
            self.stats.exhausted += 1;
            return RetryDecision::Exhausted;
        }

        let delay = self.policy.delay_for(self.context.current_attempt);
        self.context.current_attempt += 1;
        self.context.next_attempt = Some(now + delay);
        self.stats.scheduled_retries += 1;
        info!(
            "Reconnection attempt {}/{} in {:?}",
            self.context.current_attempt, self.policy.max_attempts, delay
        );
        RetryDecision::Retry {
            attempt: self.context.current_attempt,
            delay,
        }
    }
}

impl Default for ReconnectHelper {
    fn default() -> Self {
        Self::new(ReconnectPolicy::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff() {
        let policy = ReconnectPolicy::default();
        for k in 0..10u32 {
            let expected = Duration::from_millis(300_000u64.min(1000 * 2u64.pow(k)));
            assert_eq!(policy.delay_for(k), expected, "attempt {k}");
        }
        assert_eq!(policy.delay_for(8), Duration::from_secs(256));
        assert_eq!(policy.delay_for(9), Duration::from_secs(300));
        assert_eq!(policy.delay_for(40), Duration::from_secs(300));
    }

    #[test]
    fn test_failures_schedule_ten_retries_then_exhaust() {
        let mut helper = ReconnectHelper::default();
        assert_eq!(helper.context.current_attempt, 0);

        for k in 0..10u32 {
            match helper.on_failure() {
                RetryDecision::Retry { attempt, delay } => {
                    assert_eq!(attempt, k + 1);
                    assert_eq!(delay, helper.policy().delay_for(k));
                },
                RetryDecision::Exhausted => panic!("exhausted early at {k}"),
            }
        }
        assert_eq!(helper.current_attempt(), 10);

        assert_eq!(helper.on_failure(), RetryDecision::Exhausted);
        assert_eq!(helper.current_attempt(), 0);
        assert_eq!(helper.stats().exhausted, 1);
        assert_eq!(helper.stats().scheduled_retries, 10);
    }

    #[test]
    fn test_success_resets_attempts() {
        let mut helper = ReconnectHelper::default();
        helper.on_failure();
        helper.on_failure();
        assert_eq!(helper.current_attempt(), 2);

        helper.mark_connected();
        assert_eq!(helper.context.current_attempt, 0);
        assert_eq!(helper.stats().successful_connects, 1);
        assert_eq!(
            helper.on_failure(),
            RetryDecision::Retry {
                attempt: 1,
                delay: Duration::from_secs(1)
            }
        );
    }

    #[test]
    fn test_manual_reset() {
        let mut helper = ReconnectHelper::new(ReconnectPolicy {
            max_attempts: 1,
            ..ReconnectPolicy::default()
        });
        helper.on_failure();
        helper.reset();
        assert!(matches!(helper.on_failure(), RetryDecision::Retry { .. }));
    }
}
