use std::time::Duration;

use serde::Deserialize;

use crate::config::millis;

/// Exponential reconnect schedule.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    #[serde(rename = "base_delay_ms", with = "millis")]
    pub base_delay: Duration,
    pub multiplier: f64,
    #[serde(rename = "max_delay_ms", with = "millis")]
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            multiplier: 1.5,
            max_delay: Duration::from_secs(15),
            max_retries: 10,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (zero based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(i32::MAX as u32) as i32);
        let millis = self.base_delay.as_millis() as f64 * factor;
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (0..self.max_retries).map(|attempt| self.delay_for(attempt))
    }
}
