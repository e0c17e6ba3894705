//! Per-key admission control.
//!
//! Three interchangeable algorithms implement [`Limiter`]:
//! [`TokenBucketLimiter`](crate::token_bucket::TokenBucketLimiter),
//! [`SlidingWindowLimiter`](crate::sliding_window::SlidingWindowLimiter) and
//! [`GcraLimiter`](crate::gcra::GcraLimiter). Each keeps one entry per key in a
//! [`KeyedStore`], which evicts idle entries opportunistically during `allow`
//! calls; there is no background sweeper.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::{system_clock, Clock};
use crate::config::duration_ms;
use crate::context::{CallContext, CLIENT_IP_KEY};
use crate::error::{ResilienceError, Result};
use crate::gcra::GcraLimiter;
use crate::middleware::{BoxHandler, Handler, Middleware};
use crate::sliding_window::SlidingWindowLimiter;
use crate::token_bucket::TokenBucketLimiter;

/// How often an `allow` call may sweep idle entries.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(10 * 60);
/// Idle time after which an entry is evicted by a sweep.
pub const DEFAULT_INACTIVE_THRESHOLD: Duration = Duration::from_secs(30 * 60);
/// Key used when the context carries no client address.
pub const GLOBAL_KEY: &str = "global";
/// Below this many remaining permits the middleware logs that the limit is near.
pub const APPROACHING_LIMIT: u64 = 10;

/// Result of a rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    /// Request is permitted.
    Allowed {
        /// Remaining quota after this request.
        remaining: u64,
    },
    /// Request denied.
    Limited {
        /// Suggested wait before retrying, in milliseconds. Never zero.
        retry_after_ms: u64,
    },
}

impl RateLimitResult {
    /// True if the request was admitted.
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitResult::Allowed { .. })
    }

    /// Remaining quota when allowed, suggested wait in milliseconds when denied.
    pub fn info(&self) -> u64 {
        match *self {
            RateLimitResult::Allowed { remaining } => remaining,
            RateLimitResult::Limited { retry_after_ms } => retry_after_ms,
        }
    }

    /// The `(allowed, info)` pair.
    pub fn as_pair(&self) -> (bool, u64) {
        (self.is_allowed(), self.info())
    }
}

/// Per-key admission decision.
pub trait Limiter: Send + Sync {
    /// Decides whether one request for `key` may proceed now.
    fn allow(&self, key: &str) -> RateLimitResult;
}

/// Converts a wait to whole milliseconds, rounding up, never below 1.
pub(crate) fn wait_ms(wait: Duration) -> u64 {
    let nanos = wait.as_nanos();
    let ms = nanos.div_ceil(1_000_000);
    u64::try_from(ms).unwrap_or(u64::MAX).max(1)
}

/// Per-key limiter state that remembers when it was last touched.
pub trait KeyedEntry: Send {
    /// Time of the last `allow` for this key.
    fn last_update(&self) -> Instant;
}

struct StoreInner<E> {
    entries: HashMap<String, E>,
    last_clean: Instant,
}

/// Map of per-key entries with opportunistic eviction of idle keys.
pub struct KeyedStore<E> {
    inner: Mutex<StoreInner<E>>,
    cleanup_interval: Duration,
    inactive_threshold: Duration,
}

impl<E: KeyedEntry> KeyedStore<E> {
    /// Creates an empty store whose first sweep is due `cleanup_interval` after `now`.
    pub fn new(now: Instant, cleanup_interval: Duration, inactive_threshold: Duration) -> Self {
        Self {
            inner: Mutex::new(StoreInner {
                entries: HashMap::new(),
                last_clean: now,
            }),
            cleanup_interval,
            inactive_threshold,
        }
    }

    /// Runs `f` on the entry for `key`, creating it with `create` if absent.
    ///
    /// The whole operation, including a due sweep, happens under one lock.
    pub fn with_entry<R>(
        &self,
        key: &str,
        now: Instant,
        create: impl FnOnce() -> E,
        f: impl FnOnce(&mut E) -> R,
    ) -> R {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if now.saturating_duration_since(inner.last_clean) > self.cleanup_interval {
            let before = inner.entries.len();
            let threshold = self.inactive_threshold;
            inner
                .entries
                .retain(|_, entry| now.saturating_duration_since(entry.last_update()) <= threshold);
            inner.last_clean = now;
            debug!(
                evicted = before - inner.entries.len(),
                live = inner.entries.len(),
                "rate limiter swept idle keys"
            );
        }
        let entry = inner.entries.entry(key.to_string()).or_insert_with(create);
        f(entry)
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entries
            .len()
    }

    /// True if no key has state.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Algorithm and parameters of a limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
    /// Permits refilled at `rate` per second up to `capacity`.
    TokenBucket {
        /// Tokens added per second.
        rate: f64,
        /// Bucket size.
        capacity: f64,
    },
    /// At most `rate` requests in any `window`.
    SlidingWindow {
        /// Requests allowed per window.
        rate: u32,
        /// Window length.
        #[serde(with = "duration_ms")]
        window: Duration,
    },
    /// Generic cell rate algorithm.
    Gcra {
        /// Requests per second.
        rate: f64,
        /// Burst allowance in requests.
        burst: u32,
    },
}

impl Default for RateLimitAlgorithm {
    fn default() -> Self {
        RateLimitAlgorithm::TokenBucket {
            rate: 100.0,
            capacity: 100.0,
        }
    }
}

/// Limiter construction settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimiterConfig {
    /// Algorithm and its parameters.
    pub algorithm: RateLimitAlgorithm,
    /// Minimum time between idle-key sweeps.
    #[serde(with = "duration_ms")]
    pub cleanup_interval: Duration,
    /// Idle time after which a key is evicted.
    #[serde(with = "duration_ms")]
    pub inactive_threshold: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            algorithm: RateLimitAlgorithm::default(),
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            inactive_threshold: DEFAULT_INACTIVE_THRESHOLD,
        }
    }
}

impl RateLimiterConfig {
    /// Rejects non-positive rates and empty windows.
    pub fn validate(&self) -> Result<()> {
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket { rate, capacity } => {
                if !(rate > 0.0 && rate.is_finite()) {
                    return Err(ResilienceError::invalid_config(
                        "limiter.rate",
                        "must be a positive number",
                    ));
                }
                if !(capacity >= 1.0 && capacity.is_finite()) {
                    return Err(ResilienceError::invalid_config(
                        "limiter.capacity",
                        "must be at least 1",
                    ));
                }
            }
            RateLimitAlgorithm::SlidingWindow { rate, window } => {
                if rate == 0 {
                    return Err(ResilienceError::invalid_config(
                        "limiter.rate",
                        "must be at least 1",
                    ));
                }
                if window.is_zero() {
                    return Err(ResilienceError::invalid_config(
                        "limiter.window",
                        "must be non-zero",
                    ));
                }
            }
            RateLimitAlgorithm::Gcra { rate, .. } => {
                if !(rate > 0.0 && rate.is_finite()) {
                    return Err(ResilienceError::invalid_config(
                        "limiter.rate",
                        "must be a positive number",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Builds the configured limiter reading `clock`.
    pub fn build(&self, clock: Arc<dyn Clock>) -> Arc<dyn Limiter> {
        let interval = self.cleanup_interval;
        let inactive = self.inactive_threshold;
        match self.algorithm {
            RateLimitAlgorithm::TokenBucket { rate, capacity } => Arc::new(
                TokenBucketLimiter::with_clock(rate, capacity, clock)
                    .with_cleanup(interval, inactive),
            ),
            RateLimitAlgorithm::SlidingWindow { rate, window } => Arc::new(
                SlidingWindowLimiter::with_clock(rate, window, clock)
                    .with_cleanup(interval, inactive),
            ),
            RateLimitAlgorithm::Gcra { rate, burst } => Arc::new(
                GcraLimiter::with_clock(rate, burst, clock).with_cleanup(interval, inactive),
            ),
        }
    }
}

/// Derives the limiter key for a call.
pub type KeyFunc = Arc<dyn Fn(&CallContext) -> String + Send + Sync>;

/// Produces the outcome of a rejected call.
pub type FailureHandler<Req, Resp> = Arc<dyn Fn(&CallContext, Req) -> Result<Resp> + Send + Sync>;

/// Keys by the `client_ip` context value, else [`GLOBAL_KEY`].
pub fn default_key_func() -> KeyFunc {
    Arc::new(|ctx: &CallContext| match ctx.value(CLIENT_IP_KEY) {
        Some(ip) if !ip.is_empty() => ip.to_string(),
        _ => GLOBAL_KEY.to_string(),
    })
}

/// Middleware that admits calls through a [`Limiter`].
///
/// A denied call never reaches the wrapped handler. By default it fails with
/// [`ResilienceError::RateLimited`]; a failure handler may substitute any outcome.
pub struct RateLimitMiddleware<Req, Resp> {
    limiter: Arc<dyn Limiter>,
    key_func: KeyFunc,
    failure_handler: Option<FailureHandler<Req, Resp>>,
}

impl<Req, Resp> RateLimitMiddleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Wraps `limiter` with the default key function.
    pub fn new(limiter: Arc<dyn Limiter>) -> Self {
        Self {
            limiter,
            key_func: default_key_func(),
            failure_handler: None,
        }
    }

    /// Replaces the key function.
    pub fn with_key_func<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallContext) -> String + Send + Sync + 'static,
    {
        self.key_func = Arc::new(f);
        self
    }

    /// Replaces the rejection outcome.
    pub fn with_failure_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&CallContext, Req) -> Result<Resp> + Send + Sync + 'static,
    {
        self.failure_handler = Some(Arc::new(f));
        self
    }
}

impl<Req, Resp> Default for RateLimitMiddleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// Token bucket of 100 requests per second with capacity 100.
    fn default() -> Self {
        Self::new(Arc::new(TokenBucketLimiter::with_clock(
            100.0,
            100.0,
            system_clock(),
        )))
    }
}

impl<Req, Resp> Middleware<Req, Resp> for RateLimitMiddleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: BoxHandler<Req, Resp>) -> BoxHandler<Req, Resp> {
        Arc::new(LimitHandler {
            limiter: Arc::clone(&self.limiter),
            key_func: Arc::clone(&self.key_func),
            failure_handler: self.failure_handler.clone(),
            next,
        })
    }
}

struct LimitHandler<Req, Resp> {
    limiter: Arc<dyn Limiter>,
    key_func: KeyFunc,
    failure_handler: Option<FailureHandler<Req, Resp>>,
    next: BoxHandler<Req, Resp>,
}

#[async_trait]
impl<Req, Resp> Handler<Req, Resp> for LimitHandler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &CallContext, req: Req) -> Result<Resp> {
        let key = (self.key_func)(ctx);
        match self.limiter.allow(&key) {
            RateLimitResult::Limited { retry_after_ms } => {
                warn!(key = %key, path = ctx.path(), wait_ms = retry_after_ms, "rate limited");
                match &self.failure_handler {
                    Some(handler) => handler(ctx, req),
                    None => Err(ResilienceError::RateLimited {
                        key,
                        retry_after_ms,
                    }),
                }
            }
            RateLimitResult::Allowed { remaining } => {
                if remaining < APPROACHING_LIMIT {
                    debug!(key = %key, path = ctx.path(), remaining, "rate limit approaching");
                }
                self.next.call(ctx, req).await
            }
        }
    }
}
