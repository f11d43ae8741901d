//! Token-bucket pacing for outbound exchange requests.
//!
//! The bucket holds one minute's worth of tokens. `acquire` never fails;
//! when the bucket is empty the caller sleeps until a token would have
//! accrued, so over any 60 second window at most `rate` requests go out.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

pub struct RateLimiter {
    requests_per_minute: u32,
    state: Mutex<Bucket>,
}

struct Bucket {
    tokens: f64,
    last_update: Instant,
}

impl RateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            state: Mutex::new(Bucket {
                tokens: requests_per_minute as f64,
                last_update: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping if none is available yet.
    pub async fn acquire(&self) {
        let rate_per_sec = self.requests_per_minute as f64 / 60.0;
        let mut bucket = self.state.lock().await;

        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_update).as_secs_f64();
        bucket.tokens =
            (bucket.tokens + elapsed * rate_per_sec).min(self.requests_per_minute as f64);
        bucket.last_update = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            return;
        }

        // Single-mutator discipline: the lock is held across the sleep so
        // waiters are serviced in arrival order.
        let wait = (1.0 - bucket.tokens) / rate_per_sec;
        tokio::time::sleep(Duration::from_secs_f64(wait)).await;
        bucket.tokens = 0.0;
        bucket.last_update = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn burst_up_to_rate_is_immediate() {
        let limiter = RateLimiter::new(60);
        let start = Instant::now();
        for _ in 0..60 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_bucket_sleeps_one_interval() {
        let limiter = RateLimiter::new(60);
        for _ in 0..60 {
            limiter.acquire().await;
        }

        // 61st request must wait ~1s (one token at 1 token/sec).
        let start = Instant::now();
        limiter.acquire().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(990), "waited {waited:?}");
        assert!(waited <= Duration::from_millis(1100), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn tokens_refill_over_time() {
        let limiter = RateLimiter::new(120);
        for _ in 0..120 {
            limiter.acquire().await;
        }

        tokio::time::sleep(Duration::from_secs(30)).await;

        // Half a minute refills half the bucket.
        let start = Instant::now();
        for _ in 0..60 {
            limiter.acquire().await;
        }
        assert_eq!(start.elapsed(), Duration::ZERO);
    }
}
