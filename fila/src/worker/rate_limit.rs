//! A token bucket shared by the subscriptions of a push mode worker.
use std::time::Duration;

use tokio::{sync::Mutex, time::Instant};

/// At most `max` jobs started per `per`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub max: u32,
    pub per: Duration,
}

impl RateLimit {
    pub const fn per_minute(max: u32) -> Self {
        Self {
            max,
            per: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    refilled_at: Instant,
}

/// Admits up to `max` acquisitions immediately, then one every `per / max`.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    interval: Duration,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        let capacity = limit.max.max(1);
        Self {
            capacity,
            interval: limit.per / capacity,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = {
                let mut bucket = self.bucket.lock().await;
                self.refill(&mut bucket, Instant::now());
                if bucket.tokens > 0 {
                    bucket.tokens -= 1;
                    return;
                }
                self.interval
                    .saturating_sub(Instant::now().saturating_duration_since(bucket.refilled_at))
            };
            tokio::time::sleep(wait).await;
        }
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        if self.interval.is_zero() {
            bucket.tokens = self.capacity;
            return;
        }
        let elapsed = now.saturating_duration_since(bucket.refilled_at);
        let earned = (elapsed.as_nanos() / self.interval.as_nanos()).min(u128::from(self.capacity)) as u32;
        if earned == 0 {
            return;
        }
        bucket.tokens = bucket.tokens.saturating_add(earned);
        if bucket.tokens >= self.capacity {
            bucket.tokens = self.capacity;
            bucket.refilled_at = now;
        } else {
            bucket.refilled_at += self.interval * earned;
        }
    }
}
