use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_DELAY_MS: u64 = 1000;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Exponential reconnect backoff.
///
/// Attempt `n` (1-based) waits `base_delay * 2^(n-1)`; attempts past
/// `max_attempts` are not made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub base_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

impl ReconnectPolicy {
    pub const MULTIPLIER: u64 = 2;

    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
            max_attempts,
        }
    }

    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    /// Delay before reconnect attempt `attempt`, or `None` when the attempt
    /// is past the cap
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_attempts {
            return None;
        }
        let factor = Self::MULTIPLIER.saturating_pow(attempt - 1);
        Some(Duration::from_millis(self.base_delay_ms.saturating_mul(factor)))
    }

    /// Longest total wait before the policy gives up
    pub fn worst_case_downtime(&self) -> Duration {
        (1..=self.max_attempts)
            .filter_map(|attempt| self.delay_for(attempt))
            .fold(Duration::ZERO, |total, delay| total.saturating_add(delay))
    }
}
