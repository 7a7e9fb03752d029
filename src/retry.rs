//! Backoff delays between fetch attempts

use rand::Rng;
use std::time::Duration;

use crate::config::RetryConfig;

/// Delay policy for a work unit's retries.
///
/// `attempt` is the 1-indexed attempt that just failed.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn attempts(&self) -> u32 {
        self.config.attempts
    }

    /// `base * 2^(attempt-1)`, before jitter
    pub fn transient_base(&self, attempt: u32) -> Duration {
        scale(self.config.base_delay, 2, attempt)
    }

    /// `base * 3^(attempt-1)`, before jitter
    pub fn rate_limited_base(&self, attempt: u32) -> Duration {
        scale(self.config.base_delay, 3, attempt)
    }

    /// Timeouts and transient network errors
    pub fn transient_delay(&self, attempt: u32) -> Duration {
        self.transient_base(attempt) + jitter(Duration::ZERO, self.config.transient_jitter)
    }

    /// Remote quota rejections: larger base and jitter floor than [`Self::transient_delay`]
    pub fn rate_limited_delay(&self, attempt: u32) -> Duration {
        // Keep the floor above the largest transient jitter for the same attempt
        let floor = self
            .config
            .rate_limit_jitter_min
            .max(self.config.transient_jitter + Duration::from_millis(1));
        let ceiling = self.config.rate_limit_jitter_max.max(floor);
        self.rate_limited_base(attempt) + jitter(floor, ceiling)
    }
}

fn scale(base: Duration, factor: u32, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(factor.saturating_pow(exponent))
}

fn jitter(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let millis = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    Duration::from_millis(millis)
}
