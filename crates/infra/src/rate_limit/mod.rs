//! Claim-side rate limiting.
//!
//! Limiters shape how many jobs a worker may *claim* per minute. They are never
//! consulted on enqueue. Any limiter error is treated as "no budget": the claim
//! loop stops claiming and backs off (fail closed).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod in_memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use in_memory::InMemoryRateLimiter;
#[cfg(feature = "redis")]
pub use redis::RedisRateLimiter;

const WINDOW_SECS: i64 = 60;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RateLimitError {
    #[error("rate limiter unavailable: {0}")]
    Unavailable(String),
}

/// Tokens granted for one claim attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    pub granted: u32,
    /// Window the tokens were taken from (epoch minute).
    pub window: i64,
    /// Time until the next window opens.
    pub resets_in: Duration,
}

#[async_trait]
pub trait RateLimiter: Send + Sync + 'static {
    /// Take up to `want` tokens from the current window.
    async fn try_acquire(&self, want: u32) -> Result<Permit, RateLimitError>;

    /// Give back tokens taken by `permit` that were not used (fewer jobs claimed).
    async fn refund(&self, permit: &Permit, unused: u32) -> Result<(), RateLimitError>;
}

/// Epoch minute containing `now`.
pub(crate) fn window_of(now: DateTime<Utc>) -> i64 {
    now.timestamp().div_euclid(WINDOW_SECS)
}

pub(crate) fn resets_in(now: DateTime<Utc>, window: i64) -> Duration {
    let next_ms = (window + 1) * WINDOW_SECS * 1000;
    Duration::from_millis((next_ms - now.timestamp_millis()).max(1) as u64)
}
