//! Reconnect policy with capped exponential backoff.

use std::time::Duration;

/// Reconnect settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnect after abnormal closes at all.
    pub enabled: bool,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Dials allowed before giving up and entering Error.
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    /// `min(base_delay * 2^attempt, max_delay)`.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(10_000),
            max_attempts: 10,
        }
    }
}

/// Attempt counter driving a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    #[must_use]
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Delay before the next dial, or `None` once attempts are exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.policy.enabled || self.attempt >= self.policy.max_attempts {
            return None;
        }
        let delay = self.policy.delay_for(self.attempt);
        self.attempt += 1;
        Some(delay)
    }

    /// Start over, after a successful connect or an explicit `connect()`.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Attempts scheduled since the last reset.
    #[must_use]
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    #[must_use]
    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_sequence() {
        let policy = ReconnectPolicy::default();
        let delays: Vec<u64> = (0..6)
            .map(|attempt| policy.delay_for(attempt).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 8_000, 10_000, 10_000]);
    }

    #[test]
    fn test_delay_saturates() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(31), policy.max_delay);
        assert_eq!(policy.delay_for(64), policy.max_delay);
    }

    #[test]
    fn test_backoff_exhaustion_and_reset() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            max_attempts: 3,
            ..ReconnectPolicy::default()
        });

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1_000)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(2_000)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(4_000)));
        assert_eq!(backoff.next_delay(), None);
        assert_eq!(backoff.attempt(), 3);

        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(1_000)));
    }

    #[test]
    fn test_backoff_disabled() {
        let mut backoff = Backoff::new(ReconnectPolicy {
            enabled: false,
            ..ReconnectPolicy::default()
        });
        assert_eq!(backoff.next_delay(), None);
    }
}
