//! Retry delays for the sync queue.
//!
//! Exponential backoff: the n-th failed attempt waits `base * 2^(n-1)`, capped
//! at `max`, plus a random extra of up to `jitter_ratio` of that delay so that
//! devices coming back online together do not retry in lockstep.

use std::time::Duration;

use rand::Rng;

use crate::config::SyncConfig;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    jitter_ratio: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, jitter_ratio: f64) -> Self {
        Self {
            base,
            max: max.max(base),
            jitter_ratio: jitter_ratio.clamp(0.0, 1.0),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            Duration::from_millis(config.base_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
            config.jitter_ratio,
        )
    }

    /// Delay before retrying after `attempt` failures, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let max_ms = self.max.as_millis() as u64;
        let factor = 1u64
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(max_ms))
    }

    /// Delay with jitter taken from `unit`, a sample in `[0, 1)`.
    pub fn delay_with(&self, attempt: u32, unit: f64) -> Duration {
        let delay = self.base_delay(attempt);
        let extra = delay.as_millis() as f64 * self.jitter_ratio * unit.clamp(0.0, 1.0);
        delay + Duration::from_millis(extra as u64)
    }

    /// Delay with random jitter
    pub fn delay(&self, attempt: u32) -> Duration {
        let unit: f64 = rand::rng().random_range(0.0..1.0);
        self.delay_with(attempt, unit)
    }
}
