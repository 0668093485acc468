//! Capture reconnect backoff

use std::time::Duration;

use crate::config::AudioConfig;

/// Exponential backoff between reconnect attempts
///
/// Attempts are unlimited; only the delay is capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    /// Delay before the first attempt
    pub initial: Duration,
    /// Delay cap
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    #[must_use]
    pub const fn from_config(config: &AudioConfig) -> Self {
        Self {
            initial: Duration::from_millis(config.reconnect_initial_ms),
            max: Duration::from_millis(config.reconnect_max_ms),
        }
    }

    /// Delay before attempt number `attempt` (zero-based):
    /// `min(initial * 2^attempt, max)`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.initial
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max)
    }
}
