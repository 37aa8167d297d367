//! Exponential backoff for fanout retries.
//!
//! [`RetryConfig`] has two profiles:
//! - in-place handler retries (short, a few attempts)
//! - consumer-loop re-attempts while the broker is unavailable (longer)
//!
//! Producer flushes retry through the `backon` builder from [`flush_backoff`].

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use backon::ExponentialBuilder;
use serde::Deserialize;

/// Exponential, capped and jittered retry schedule.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, before jitter.
    #[serde(with = "crate::config::duration_ms", rename = "base_delay_ms")]
    pub base_delay: Duration,
    /// Upper bound for any single delay, before jitter.
    #[serde(with = "crate::config::duration_ms", rename = "max_delay_ms")]
    pub max_delay: Duration,
    /// Retries after the first attempt. Zero means fail on the first error.
    pub max_retries: u32,
    /// Delays are scaled by a factor in `[1 - jitter, 1 + jitter]`.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::for_handlers()
    }
}

impl RetryConfig {
    /// 10ms doubling up to 2s, 3 retries, ±25% jitter.
    pub fn for_handlers() -> Self {
        Self {
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(2),
            max_retries: 3,
            jitter: 0.25,
        }
    }

    /// 250ms doubling up to 10s, 8 retries, ±25% jitter.
    pub fn for_consumer() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(10),
            max_retries: 8,
            jitter: 0.25,
        }
    }

    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::for_handlers()
        }
    }

    /// Delay before retry number `attempt` (0-indexed): `base * 2^attempt`,
    /// capped at `max_delay`, then jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(20)).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor).min(self.max_delay);

        if self.jitter <= 0.0 {
            return delay;
        }
        Duration::from_millis((delay.as_millis() as f64 * self.jitter_factor(attempt)) as u64)
    }

    /// Factor in `[1 - jitter, 1 + jitter)`, seeded from the clock so that
    /// concurrent retriers spread out.
    fn jitter_factor(&self, attempt: u32) -> f64 {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let seed = nanos.wrapping_mul(31).wrapping_add(u64::from(attempt) * 17);
        let unit = (seed % 1000) as f64 / 1000.0;
        1.0 + (unit * 2.0 - 1.0) * self.jitter
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// Backoff for producer flushes: 50ms up to 2s with jitter, `max_times`
/// retries.
pub fn flush_backoff(max_times: usize) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(Duration::from_secs(2))
        .with_max_times(max_times)
        .with_jitter()
}
