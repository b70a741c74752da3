//! Process-local fixed-window limiter.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dmflow_core::{Clock, SystemClock};

use super::{Permit, RateLimitError, RateLimiter, resets_in, window_of};

#[derive(Debug, Default)]
struct Window {
    start: i64,
    used: u32,
}

/// Fixed one-minute window shared by every worker in the process.
pub struct InMemoryRateLimiter {
    per_minute: u32,
    window: Mutex<Window>,
    clock: Arc<dyn Clock>,
}

impl InMemoryRateLimiter {
    pub fn new(per_minute: u32) -> Self {
        Self {
            per_minute,
            window: Mutex::new(Window::default()),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

impl std::fmt::Debug for InMemoryRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryRateLimiter")
            .field("per_minute", &self.per_minute)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RateLimiter for InMemoryRateLimiter {
    async fn try_acquire(&self, want: u32) -> Result<Permit, RateLimitError> {
        let now = self.clock.now();
        let current = window_of(now);
        let mut window = self
            .window
            .lock()
            .map_err(|_| RateLimitError::Unavailable("rate limiter lock poisoned".to_string()))?;

        if window.start != current {
            *window = Window {
                start: current,
                used: 0,
            };
        }
        let granted = want.min(self.per_minute.saturating_sub(window.used));
        window.used += granted;

        Ok(Permit {
            granted,
            window: current,
            resets_in: resets_in(now, current),
        })
    }

    async fn refund(&self, permit: &Permit, unused: u32) -> Result<(), RateLimitError> {
        let mut window = self
            .window
            .lock()
            .map_err(|_| RateLimitError::Unavailable("rate limiter lock poisoned".to_string()))?;
        if window.start == permit.window {
            window.used = window.used.saturating_sub(unused.min(permit.granted));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dmflow_core::ManualClock;

    fn limiter(per_minute: u32) -> (InMemoryRateLimiter, ManualClock) {
        let clock = ManualClock::default();
        let limiter = InMemoryRateLimiter::new(per_minute).with_clock(Arc::new(clock.clone()));
        (limiter, clock)
    }

    #[tokio::test]
    async fn grants_up_to_the_budget() {
        let (limiter, _clock) = limiter(25);
        assert_eq!(limiter.try_acquire(10).await.unwrap().granted, 10);
        assert_eq!(limiter.try_acquire(10).await.unwrap().granted, 10);
        assert_eq!(limiter.try_acquire(10).await.unwrap().granted, 5);
        let exhausted = limiter.try_acquire(10).await.unwrap();
        assert_eq!(exhausted.granted, 0);
        assert!(exhausted.resets_in <= std::time::Duration::from_secs(60));
    }

    #[tokio::test]
    async fn new_window_restores_budget() {
        let (limiter, clock) = limiter(5);
        assert_eq!(limiter.try_acquire(5).await.unwrap().granted, 5);
        assert_eq!(limiter.try_acquire(1).await.unwrap().granted, 0);
        clock.advance(chrono::Duration::seconds(61));
        assert_eq!(limiter.try_acquire(3).await.unwrap().granted, 3);
    }

    #[tokio::test]
    async fn refund_returns_unused_tokens() {
        let (limiter, _clock) = limiter(10);
        let permit = limiter.try_acquire(10).await.unwrap();
        limiter.refund(&permit, 4).await.unwrap();
        assert_eq!(limiter.try_acquire(10).await.unwrap().granted, 4);
    }
}
