//! Retry/backoff policy.
//!
//! The policy is a pure function of the attempt count: it does not look at the
//! job type or payload.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total number of attempts a job gets before it is dead-lettered.
    pub max_retries: u32,
    /// Base delay; the delay after `n` attempts is `base * 2^n`.
    pub base_delay: Duration,
    /// Ceiling applied before jitter.
    pub max_delay: Duration,
    /// Jitter factor (0.0-1.0); the delay is spread by `±jitter`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(600),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a policy that dead-letters on the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 1,
            ..Default::default()
        }
    }

    /// Create a policy with exponential backoff.
    pub fn exponential(max_retries: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            max_delay,
            jitter: 0.2,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Un-jittered delay: `min(base * 2^attempts, cap)`.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let max_ms = self.max_delay.as_millis() as f64;
        let exp = 2_f64.powi(attempts.min(62) as i32);
        Duration::from_millis((base_ms * exp).min(max_ms) as u64)
    }

    /// Delay with jitter drawn from the thread-local RNG.
    pub fn jittered_backoff(&self, attempts: u32) -> Duration {
        let unit = if self.jitter > 0.0 {
            rand::rng().random_range(-1.0..=1.0)
        } else {
            0.0
        };
        self.backoff_with_unit(attempts, unit)
    }

    /// Delay with an explicit jitter sample `unit` in `[-1.0, 1.0]`.
    pub fn backoff_with_unit(&self, attempts: u32, unit: f64) -> Duration {
        let delay_ms = self.backoff(attempts).as_millis() as f64;
        let spread = delay_ms * self.jitter * unit.clamp(-1.0, 1.0);
        Duration::from_millis((delay_ms + spread).max(0.0) as u64)
    }

    /// Check if a job that has been claimed `attempts` times may run again.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts < self.max_retries
    }
}
