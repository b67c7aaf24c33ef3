//! Exponential backoff for transient backend failures.
//!
//! The poll loop waits [`BackoffConfig::initial_delay`] after the first
//! failed history request and grows the wait by
//! [`BackoffConfig::multiplier`] per consecutive failure, never past
//! [`BackoffConfig::max_delay`]. A successful request resets the delay.

use std::time::Duration;

/// Tunable parameters for the exponential-backoff strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay after the first failure.
    pub initial_delay: Duration,
    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,
    /// Factor by which the delay grows after each failure.
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    /// Fixed 1s retry.
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
        }
    }
}

impl BackoffConfig {
    /// Constant delay between attempts.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
        }
    }
}

/// Calculate the next backoff delay from the current delay and config.
///
/// The result is clamped to [`BackoffConfig::max_delay`].
pub fn next_delay(current: Duration, config: &BackoffConfig) -> Duration {
    let next_ms = (current.as_millis() as f64 * config.multiplier) as u64;
    Duration::from_millis(next_ms).min(config.max_delay)
}
