//! Capped exponential backoff for reconnect attempts.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Delay before the first retry (default: 100ms).
    pub initial_delay_ms: u64,
    /// Upper bound on the delay (default: 30 seconds).
    pub max_delay_ms: u64,
    /// Growth factor per failed attempt (default: 2.0).
    pub multiplier: f64,
    /// Add up to 50% random jitter, never past the upper bound (default: true).
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Attempt counter for one connection.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
    attempt: u32,
}

impl Backoff {
    /// Start with no failures recorded.
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Record a failure and return how long to wait before the next try.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.compute(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// Clear the failure count after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures recorded since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// `initial * multiplier^attempt` plus jitter, capped at the maximum.
    fn compute(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay_ms as f64;
        let max = self.config.max_delay_ms as f64;
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let capped = (base * self.config.multiplier.max(1.0).powi(exponent)).min(max);
        let capped = if capped.is_finite() { capped as u64 } else { self.config.max_delay_ms };

        if self.config.jitter && capped > 1 {
            let jitter = rand::thread_rng().gen_range(0..=capped / 2);
            Duration::from_millis(capped.saturating_add(jitter).min(self.config.max_delay_ms))
        } else {
            Duration::from_millis(capped)
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
