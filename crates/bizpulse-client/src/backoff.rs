//! Reconnect delay schedule.

use std::time::Duration;

use bizpulse_settings::ClientSettings;

/// Exponential backoff without jitter: attempt `n` (1-based) waits
/// `base * 2^(n-1)`, capped at `max_delay`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Reconnect attempts after a disconnect before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_settings(settings: &ClientSettings) -> Self {
        Self {
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
            max_attempts: settings.max_attempts,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-based; 0 is treated as 1).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Every delay the policy will wait, in order.
    pub fn schedule(&self) -> Vec<Duration> {
        (1..=self.max_attempts).map(|n| self.delay(n)).collect()
    }
}
