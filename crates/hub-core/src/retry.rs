//! Reconnect schedule for broker connections.
//!
//! A burst of short retries rides out a broker restart, after which the
//! caller keeps trying at a long fixed interval, forever.

use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub short_interval: Duration,
    /// Number of failed attempts retried at `short_interval`.
    pub short_attempts: u32,
    pub long_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            short_interval: Duration::from_secs(3),
            short_attempts: 20,
            long_interval: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, after `failed_attempts` consecutive failures
    /// (zero-based: the first failure is attempt 0).
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        if failed_attempts < self.short_attempts {
            self.short_interval
        } else {
            self.long_interval
        }
    }
}
