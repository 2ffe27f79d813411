use std::time::Duration;

use rand::Rng;

use crate::config::{AdmissionConfig, DEFAULT_JITTER_MAX, DEFAULT_JITTER_MIN};

/// `min(cap, base * 2^attempt + jitter)` with jitter drawn from the default
/// 250..750 ms window. `attempt` counts prior tries.
pub fn next_delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    BackoffPolicy::new(base, cap).delay_for(attempt)
}

/// Exponential backoff with additive uniform jitter, capped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    base: Duration,
    cap: Duration,
    jitter_min: Duration,
    jitter_max: Duration,
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            jitter_min: DEFAULT_JITTER_MIN,
            jitter_max: DEFAULT_JITTER_MAX,
        }
    }

    pub fn from_config(config: &AdmissionConfig) -> Self {
        Self::new(config.initial_backoff, config.backoff_cap)
            .with_jitter(config.jitter_min, config.jitter_max)
    }

    pub fn with_jitter(mut self, min: Duration, max: Duration) -> Self {
        self.jitter_min = min.min(max);
        self.jitter_max = min.max(max);
        self
    }

    /// `base * 2^attempt`, saturating.
    pub fn exponential(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor)
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.exponential(attempt)
            .saturating_add(self.jitter())
            .min(self.cap)
    }

    fn jitter(&self) -> Duration {
        let lo = self.jitter_min.as_millis() as u64;
        let hi = self.jitter_max.as_millis() as u64;
        if lo >= hi {
            return Duration::from_millis(lo);
        }
        Duration::from_millis(rand::rng().random_range(lo..=hi))
    }
}
