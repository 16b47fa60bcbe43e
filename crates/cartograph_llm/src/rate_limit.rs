//! Token-bucket rate limiting for the LLM endpoint.
//!
//! Requests acquire one token; the bucket refills continuously at the
//! configured rate. Acquire suspends rather than erroring, so backpressure
//! propagates to the worker pools naturally.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::time::sleep;

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

pub struct RateLimiter {
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(capacity: u32, refill_per_sec: f64) -> Self {
        Self {
            capacity: capacity as f64,
            refill_per_sec,
            bucket: Mutex::new(Bucket {
                tokens: capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Limiter allowing `per_minute` requests per minute with a burst of
    /// one tenth of that.
    pub fn per_minute(per_minute: u32) -> Self {
        let burst = (per_minute / 10).max(1);
        Self::new(burst, per_minute as f64 / 60.0)
    }

    /// Take one token, waiting as long as necessary.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().expect("rate limiter poisoned");
                let elapsed = bucket.last_refill.elapsed().as_secs_f64();
                bucket.tokens =
                    (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
                bucket.last_refill = Instant::now();

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return;
                }
                // Time until one token is available
                Duration::from_secs_f64((1.0 - bucket.tokens) / self.refill_per_sec)
            };
            sleep(wait).await;
        }
    }

    /// Try to take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock().expect("rate limiter poisoned");
        let elapsed = bucket.last_refill.elapsed().as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        bucket.last_refill = Instant::now();
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
