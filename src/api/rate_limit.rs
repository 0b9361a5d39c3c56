//! Minimum-spacing rate limiter keyed by string.
//!
//! `check` rejects a request that arrives sooner than `1 / requests_per_second`
//! after the previous accepted one for the same key. `acquire` waits out the
//! remaining spacing instead and reserves the slot before sleeping, so
//! concurrent callers queue up rather than all firing at once.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use super::ApiError;

#[derive(Debug)]
pub struct RateLimiter {
    requests_per_second: u32,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    /// `0` disables limiting.
    pub fn new(requests_per_second: u32) -> Self {
        Self { requests_per_second, last_request: Mutex::new(HashMap::new()) }
    }

    pub fn requests_per_second(&self) -> u32 {
        self.requests_per_second
    }

    fn interval(&self) -> Duration {
        if self.requests_per_second == 0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(1.0 / self.requests_per_second as f64)
        }
    }

    pub fn check(&self, key: &str) -> Result<(), ApiError> {
        let interval = self.interval();
        let now = Instant::now();
        let mut last = self
            .last_request
            .lock()
            .map_err(|_| ApiError::Connection("rate limiter lock poisoned".into()))?;
        if let Some(prev) = last.get(key) {
            if now.saturating_duration_since(*prev) < interval {
                return Err(ApiError::RateLimited { api: key.to_string() });
            }
        }
        last.insert(key.to_string(), now);
        Ok(())
    }

    pub async fn acquire(&self, key: &str) -> Result<(), ApiError> {
        let interval = self.interval();
        let wait = {
            let now = Instant::now();
            let mut last = self
                .last_request
                .lock()
                .map_err(|_| ApiError::Connection("rate limiter lock poisoned".into()))?;
            let slot = match last.get(key) {
                Some(prev) => (*prev + interval).max(now),
                None => now,
            };
            last.insert(key.to_string(), slot);
            slot - now
        };
        if !wait.is_zero() {
            tracing::debug!(api = key, wait_ms = wait.as_millis() as u64, "rate limit: waiting");
            tokio::time::sleep(wait).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn check_rejects_within_interval() {
        let limiter = RateLimiter::new(2);
        limiter.check("opensea").unwrap();
        assert!(matches!(limiter.check("opensea"), Err(ApiError::RateLimited { api }) if api == "opensea"));
        // other keys are independent
        limiter.check("etherscan").unwrap();
        tokio::time::advance(Duration::from_millis(501)).await;
        limiter.check("opensea").unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_spaces_requests() {
        let limiter = RateLimiter::new(4);
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire("defillama").await.unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn zero_rate_is_unlimited() {
        let limiter = RateLimiter::new(0);
        limiter.check("x").unwrap();
        limiter.check("x").unwrap();
        limiter.acquire("x").await.unwrap();
    }
}
