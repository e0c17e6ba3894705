//! Generic cell rate algorithm limiter.
//!
//! Each key tracks a theoretical arrival time `tau`, starting `burst`
//! emission intervals in the past. A request arriving before `tau` is denied
//! until `tau`; otherwise it is admitted and `tau` moves to
//! `max(tau + interval, now)`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::clock::{system_clock, Clock};
use crate::ratelimit::{
    wait_ms, KeyedEntry, KeyedStore, Limiter, RateLimitResult, DEFAULT_CLEANUP_INTERVAL,
    DEFAULT_INACTIVE_THRESHOLD,
};

#[derive(Debug)]
struct Cell {
    tau: Instant,
    last_update: Instant,
}

impl KeyedEntry for Cell {
    fn last_update(&self) -> Instant {
        self.last_update
    }
}

/// Per-key GCRA state.
pub struct GcraLimiter {
    increment: Duration,
    burst: u32,
    clock: Arc<dyn Clock>,
    cells: KeyedStore<Cell>,
}

impl GcraLimiter {
    /// Creates a limiter for `rate` requests per second with `burst` allowance.
    pub fn new(rate: f64, burst: u32) -> Self {
        Self::with_clock(rate, burst, system_clock())
    }

    /// Creates a limiter reading `clock`.
    pub fn with_clock(rate: f64, burst: u32, clock: Arc<dyn Clock>) -> Self {
        let increment = Duration::try_from_secs_f64(1.0 / rate).unwrap_or(Duration::MAX);
        let cells = KeyedStore::new(
            clock.now(),
            DEFAULT_CLEANUP_INTERVAL,
            DEFAULT_INACTIVE_THRESHOLD,
        );
        Self {
            increment,
            burst,
            clock,
            cells,
        }
    }

    /// Overrides the sweep interval and idle threshold.
    pub fn with_cleanup(mut self, interval: Duration, inactive: Duration) -> Self {
        self.cells = KeyedStore::new(self.clock.now(), interval, inactive);
        self
    }

    /// The emission interval, `1 / rate`.
    pub fn increment(&self) -> Duration {
        self.increment
    }

    /// Number of keys with state.
    pub fn len(&self) -> usize {
        self.cells.len()
    }

    /// True if no key has state.
    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }
}

impl Limiter for GcraLimiter {
    fn allow(&self, key: &str) -> RateLimitResult {
        let now = self.clock.now();
        let (increment, burst) = (self.increment, self.burst);
        self.cells.with_entry(
            key,
            now,
            || {
                let head_start = increment.saturating_mul(burst);
                Cell {
                    // Monotonic instants cannot always reach that far back.
                    tau: now.checked_sub(head_start).unwrap_or(now),
                    last_update: now,
                }
            },
            |cell| {
                if cell.tau > now {
                    return RateLimitResult::Limited {
                        retry_after_ms: wait_ms(cell.tau - now),
                    };
                }

                let next = cell.tau.checked_add(increment).unwrap_or(cell.tau);
                cell.tau = next.max(now);
                cell.last_update = now;

                let remaining = match now.checked_duration_since(cell.tau) {
                    Some(ahead) if !increment.is_zero() => {
                        (ahead.as_secs_f64() / increment.as_secs_f64()) as u64
                    }
                    _ => 0,
                };
                RateLimitResult::Allowed {
                    remaining: remaining.min(burst as u64),
                }
            },
        )
    }
}
