//! Token bucket limiter.
//!
//! Each key owns a bucket of `capacity` permits refilled continuously at
//! `rate` permits per second. Refill is computed on access from the time
//! elapsed since the key's last update.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{system_clock, Clock};
use crate::ratelimit::{
    wait_ms, KeyedEntry, KeyedStore, Limiter, RateLimitResult, DEFAULT_CLEANUP_INTERVAL,
    DEFAULT_INACTIVE_THRESHOLD,
};

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_update: Instant,
}

impl KeyedEntry for Bucket {
    fn last_update(&self) -> Instant {
        self.last_update
    }
}

/// Per-key token bucket.
pub struct TokenBucketLimiter {
    rate: f64,
    capacity: f64,
    clock: Arc<dyn Clock>,
    buckets: KeyedStore<Bucket>,
}

impl TokenBucketLimiter {
    /// Creates a limiter refilling `rate` tokens per second up to `capacity`.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self::with_clock(rate, capacity, system_clock())
    }

    /// Creates a limiter reading `clock`.
    pub fn with_clock(rate: f64, capacity: f64, clock: Arc<dyn Clock>) -> Self {
        let buckets = KeyedStore::new(
            clock.now(),
            DEFAULT_CLEANUP_INTERVAL,
            DEFAULT_INACTIVE_THRESHOLD,
        );
        Self {
            rate,
            capacity,
            clock,
            buckets,
        }
    }

    /// Overrides the sweep interval and idle threshold.
    pub fn with_cleanup(mut self, interval: Duration, inactive: Duration) -> Self {
        self.buckets = KeyedStore::new(self.clock.now(), interval, inactive);
        self
    }

    /// Number of keys with a bucket.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// True if no key has a bucket.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Limiter for TokenBucketLimiter {
    fn allow(&self, key: &str) -> RateLimitResult {
        let now = self.clock.now();
        let (rate, capacity) = (self.rate, self.capacity);
        self.buckets.with_entry(
            key,
            now,
            || Bucket {
                tokens: capacity,
                last_update: now,
            },
            |bucket| {
                let elapsed = now.saturating_duration_since(bucket.last_update).as_secs_f64();
                bucket.tokens = capacity.min(bucket.tokens + elapsed * rate);
                bucket.last_update = now;

                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    RateLimitResult::Allowed {
                        remaining: bucket.tokens as u64,
                    }
                } else {
                    let wait = Duration::try_from_secs_f64((1.0 - bucket.tokens) / rate)
                        .unwrap_or(Duration::MAX);
                    RateLimitResult::Limited {
                        retry_after_ms: wait_ms(wait),
                    }
                }
            },
        )
    }
}
