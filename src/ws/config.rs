use std::time::Duration;

use bon::Builder;

use super::backoff::BackoffPolicy;

const DEFAULT_BASE_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Configuration for the notification connection.
///
/// ```
/// use std::time::Duration;
///
/// use clawsquare_agent_sdk::ws::config::Config;
///
/// let config = Config::builder()
///     .max_reconnect_delay(Duration::from_secs(10))
///     .build();
/// assert!(config.auto_reconnect);
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Reconnect in the background after the connection drops. Does not apply to the very
    /// first `connect()`, whose failure is returned to the caller.
    #[builder(default = true)]
    pub auto_reconnect: bool,
    /// Delay before the first reconnect attempt after a drop
    #[builder(default = DEFAULT_BASE_RECONNECT_DELAY)]
    pub base_reconnect_delay: Duration,
    /// Ceiling for the exponential reconnect delay
    #[builder(default = DEFAULT_MAX_RECONNECT_DELAY)]
    pub max_reconnect_delay: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            base_reconnect_delay: DEFAULT_BASE_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
        }
    }
}

impl Config {
    #[must_use]
    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy::new(self.base_reconnect_delay, self.max_reconnect_delay)
    }
}
