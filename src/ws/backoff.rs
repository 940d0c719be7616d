use std::time::Duration;

use backoff::backoff::Backoff;

/// Deterministic capped exponential delay: `min(base * 2^attempt, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    max: Duration,
}

impl BackoffPolicy {
    #[must_use]
    pub const fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay before reconnect attempt number `attempt` (0-indexed).
    ///
    /// Saturates at the configured maximum instead of overflowing, for any `attempt`.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        2_u32
            .checked_pow(attempt)
            .and_then(|factor| self.base.checked_mul(factor))
            .map_or(self.max, |delay| delay.min(self.max))
    }

    #[must_use]
    pub const fn base(&self) -> Duration {
        self.base
    }

    #[must_use]
    pub const fn max(&self) -> Duration {
        self.max
    }
}

/// Attempt counter paired with a [`BackoffPolicy`].
///
/// Every [`Backoff::next_backoff`] hands out the delay for the current attempt and then counts
/// it; [`Backoff::reset`] is called once a connection opens.
#[derive(Debug, Clone)]
pub(crate) struct ReconnectBackoff {
    policy: BackoffPolicy,
    attempt: u32,
}

impl ReconnectBackoff {
    pub(crate) const fn new(policy: BackoffPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Number of reconnects scheduled since the last successful open.
    pub(crate) const fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Backoff for ReconnectBackoff {
    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn next_backoff(&mut self) -> Option<Duration> {
        let delay = self.policy.delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        Some(delay)
    }
}
