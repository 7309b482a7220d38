//! Rate limiting utilities

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use crate::MonotonicInstant;

/// Simple fixed-window token-bucket rate limiter, one bucket per key
#[derive(Debug)]
pub struct RateLimiter<K> {
    /// Maximum tokens (requests) per bucket
    max_tokens: u32,
    /// How often tokens are replenished
    refill_interval: Duration,
    buckets: HashMap<K, Bucket>,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: MonotonicInstant,
}

impl<K: Eq + Hash + Clone> RateLimiter<K> {
    /// Allow `max_requests` per `interval` for each key
    pub fn new(max_requests: u32, interval: Duration) -> Self {
        Self {
            max_tokens: max_requests,
            refill_interval: interval,
            buckets: HashMap::new(),
        }
    }

    /// Returns `true` if the request is allowed, `false` if rate limited
    pub fn check(&mut self, key: &K) -> bool {
        self.check_at(key, MonotonicInstant::now())
    }

    /// Same as [`RateLimiter::check`] with an explicit time source
    pub fn check_at(&mut self, key: &K, now: MonotonicInstant) -> bool {
        let max_tokens = self.max_tokens;
        let bucket = self.buckets.entry(key.clone()).or_insert(Bucket {
            tokens: max_tokens,
            last_refill: now,
        });

        if now.duration_since(bucket.last_refill) >= self.refill_interval {
            bucket.tokens = max_tokens;
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Forget a key's state (e.g. on client disconnect)
    pub fn remove(&mut self, key: &K) {
        self.buckets.remove(key);
    }

    pub fn tracked_keys(&self) -> usize {
        self.buckets.len()
    }
}
