//! Sliding window log limiter.
//!
//! Each key keeps the admission times of its requests inside the last
//! `window`. A request is admitted while fewer than `rate` of them remain.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{system_clock, Clock};
use crate::ratelimit::{
    wait_ms, KeyedEntry, KeyedStore, Limiter, RateLimitResult, DEFAULT_CLEANUP_INTERVAL,
    DEFAULT_INACTIVE_THRESHOLD,
};

#[derive(Debug)]
struct Window {
    timestamps: VecDeque<Instant>,
    last_update: Instant,
}

impl KeyedEntry for Window {
    fn last_update(&self) -> Instant {
        self.last_update
    }
}

/// Per-key sliding window.
pub struct SlidingWindowLimiter {
    rate: u32,
    window: Duration,
    clock: Arc<dyn Clock>,
    windows: KeyedStore<Window>,
}

impl SlidingWindowLimiter {
    /// Creates a limiter admitting `rate` requests per `window`.
    pub fn new(rate: u32, window: Duration) -> Self {
        Self::with_clock(rate, window, system_clock())
    }

    /// Creates a limiter reading `clock`.
    pub fn with_clock(rate: u32, window: Duration, clock: Arc<dyn Clock>) -> Self {
        let windows = KeyedStore::new(
            clock.now(),
            DEFAULT_CLEANUP_INTERVAL,
            DEFAULT_INACTIVE_THRESHOLD,
        );
        Self {
            rate,
            window,
            clock,
            windows,
        }
    }

    /// Overrides the sweep interval and idle threshold.
    pub fn with_cleanup(mut self, interval: Duration, inactive: Duration) -> Self {
        self.windows = KeyedStore::new(self.clock.now(), interval, inactive);
        self
    }

    /// Number of keys with a window.
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    /// True if no key has a window.
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

impl Limiter for SlidingWindowLimiter {
    fn allow(&self, key: &str) -> RateLimitResult {
        let now = self.clock.now();
        let (rate, window) = (self.rate as usize, self.window);
        self.windows.with_entry(
            key,
            now,
            || Window {
                timestamps: VecDeque::with_capacity(rate),
                last_update: now,
            },
            |w| {
                // Timestamps are appended in order, so expired ones are at the front.
                while let Some(&oldest) = w.timestamps.front() {
                    if now.saturating_duration_since(oldest) > window {
                        w.timestamps.pop_front();
                    } else {
                        break;
                    }
                }
                w.last_update = now;

                if w.timestamps.len() < rate {
                    w.timestamps.push_back(now);
                    return RateLimitResult::Allowed {
                        remaining: (rate - w.timestamps.len()) as u64,
                    };
                }

                let wait = match w.timestamps.front() {
                    Some(&oldest) => (oldest + window).saturating_duration_since(now),
                    None => window,
                };
                RateLimitResult::Limited {
                    retry_after_ms: wait_ms(wait),
                }
            },
        )
    }
}
