//! Redis fixed-window limiter shared by every worker process.
//!
//! ## Keys
//!
//! - `dmflow:ratelimit:<epoch minute>`: tokens taken in that minute, expires after two
//!   windows
//!
//! `INCRBY` is atomic, so concurrent workers never read-then-write the counter.
//! Tokens taken beyond the limit are handed back with `DECRBY` in the same call.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use tracing::instrument;

use super::{Permit, RateLimitError, RateLimiter, resets_in, window_of};

const DEFAULT_KEY_PREFIX: &str = "dmflow:ratelimit";
const KEY_TTL_SECS: i64 = 120;

#[derive(Clone)]
pub struct RedisRateLimiter {
    conn: ConnectionManager,
    key_prefix: String,
    per_minute: u32,
}

impl RedisRateLimiter {
    /// Connect to Redis (e.g. "redis://localhost:6379").
    pub async fn connect(redis_url: impl AsRef<str>, per_minute: u32) -> Result<Self, RateLimitError> {
        let client = redis::Client::open(redis_url.as_ref())
            .map_err(|e| RateLimitError::Unavailable(e.to_string()))?;
        let conn = ConnectionManager::new(client)
            .await
            .map_err(|e| RateLimitError::Unavailable(e.to_string()))?;
        Ok(Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            per_minute,
        })
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    fn key(&self, window: i64) -> String {
        format!("{}:{}", self.key_prefix, window)
    }
}

impl std::fmt::Debug for RedisRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRateLimiter")
            .field("key_prefix", &self.key_prefix)
            .field("per_minute", &self.per_minute)
            .finish_non_exhaustive()
    }
}

/// Tokens granted when the counter reads `after` following an `INCRBY want`.
fn granted_from_counter(after: i64, want: u32, limit: u32) -> u32 {
    let before = after - i64::from(want);
    let available = (i64::from(limit) - before).clamp(0, i64::from(want));
    available as u32
}

#[async_trait]
impl RateLimiter for RedisRateLimiter {
    #[instrument(skip(self), fields(key_prefix = %self.key_prefix), err)]
    async fn try_acquire(&self, want: u32) -> Result<Permit, RateLimitError> {
        let now = Utc::now();
        let window = window_of(now);
        let key = self.key(window);
        let mut conn = self.conn.clone();

        let (after,): (i64,) = redis::pipe()
            .atomic()
            .cmd("INCRBY")
            .arg(&key)
            .arg(want)
            .cmd("EXPIRE")
            .arg(&key)
            .arg(KEY_TTL_SECS)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| RateLimitError::Unavailable(e.to_string()))?;

        let granted = granted_from_counter(after, want, self.per_minute);
        let excess = want - granted;
        if excess > 0 {
            redis::cmd("DECRBY")
                .arg(&key)
                .arg(excess)
                .query_async::<_, i64>(&mut conn)
                .await
                .map_err(|e| RateLimitError::Unavailable(e.to_string()))?;
        }

        Ok(Permit {
            granted,
            window,
            resets_in: resets_in(now, window),
        })
    }

    #[instrument(skip(self), err)]
    async fn refund(&self, permit: &Permit, unused: u32) -> Result<(), RateLimitError> {
        let unused = unused.min(permit.granted);
        if unused == 0 {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::cmd("DECRBY")
            .arg(self.key(permit.window))
            .arg(unused)
            .query_async::<_, i64>(&mut conn)
            .await
            .map_err(|e| RateLimitError::Unavailable(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counter_arithmetic() {
        assert_eq!(granted_from_counter(10, 10, 25), 10);
        assert_eq!(granted_from_counter(30, 10, 25), 5);
        assert_eq!(granted_from_counter(40, 10, 25), 0);
        assert_eq!(granted_from_counter(5, 5, 0), 0);
    }
}
