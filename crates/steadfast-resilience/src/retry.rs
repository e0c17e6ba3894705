//! Bounded retry with backoff.
//!
//! The wrapped call runs up to `attempts` times. Between attempts the executor
//! waits `base_delay`, growing by 1.5x per further retry when `backoff` is on
//! and never beyond `max_delay`. The wait races the call's context, so a
//! cancellation or deadline ends the call immediately with
//! [`ResilienceError::Cancelled`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::duration_ms;
use crate::context::CallContext;
use crate::error::{ResilienceError, Result};
use crate::middleware::{BoxHandler, BoxMiddleware, Handler, Middleware};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total tries including the first (default: 3).
    pub attempts: u32,
    /// Wait before the first retry (default: 100ms).
    #[serde(with = "duration_ms")]
    pub base_delay: Duration,
    /// Grow the wait between later retries (default: true).
    pub backoff: bool,
    /// Cap on the grown wait (default: 2 seconds).
    #[serde(with = "duration_ms")]
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(100),
            backoff: true,
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryConfig {
    /// Rejects a configuration that would never run the call.
    pub fn validate(&self) -> Result<()> {
        if self.attempts == 0 {
            return Err(ResilienceError::invalid_config(
                "retry.attempts",
                "must be at least 1",
            ));
        }
        Ok(())
    }

    /// Delay before retry number `retry` (0-based), given the previous delay.
    fn next_delay(&self, previous: Duration, retry: u32) -> Duration {
        if !self.backoff || retry == 0 {
            return previous;
        }
        // x1.5 in integer nanoseconds.
        (previous.saturating_mul(3) / 2).min(self.max_delay)
    }

    /// The waits a call that keeps failing goes through, in order.
    pub fn delays(&self) -> Vec<Duration> {
        let mut delay = self.base_delay;
        (0..self.attempts.saturating_sub(1))
            .map(|retry| {
                delay = self.next_delay(delay, retry);
                delay
            })
            .collect()
    }
}

/// Decides whether an attempt's outcome should be retried.
pub type RetryPredicate<Req, Resp> =
    Arc<dyn Fn(&CallContext, &Req, &Result<Resp>) -> bool + Send + Sync>;

/// Retries any error except client errors and fail-fast control signals.
///
/// Retrying a rejection from a breaker or limiter would defeat its purpose, and
/// a 4xx will fail the same way again.
pub fn default_retry_if<Req, Resp>(
    _ctx: &CallContext,
    _req: &Req,
    result: &Result<Resp>,
) -> bool {
    match result {
        Ok(_) => false,
        Err(err) => !(err.is_control_signal() || err.is_client_error()),
    }
}

/// Retry executor; also usable as a middleware.
pub struct Retry<Req, Resp> {
    config: RetryConfig,
    retry_if: RetryPredicate<Req, Resp>,
}

impl<Req, Resp> Clone for Retry<Req, Resp> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            retry_if: Arc::clone(&self.retry_if),
        }
    }
}

impl<Req, Resp> Retry<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
{
    /// Creates an executor with [`default_retry_if`].
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            retry_if: Arc::new(default_retry_if::<Req, Resp>),
        }
    }

    /// Replaces the retry predicate.
    pub fn with_predicate<F>(mut self, retry_if: F) -> Self
    where
        F: Fn(&CallContext, &Req, &Result<Resp>) -> bool + Send + Sync + 'static,
    {
        self.retry_if = Arc::new(retry_if);
        self
    }

    /// The executor's configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Runs `next` until it succeeds, the predicate declines, or attempts run out.
    ///
    /// Returns the last attempt's outcome unchanged, or
    /// [`ResilienceError::Cancelled`] if the context ends first.
    pub async fn execute(
        &self,
        ctx: &CallContext,
        req: Req,
        next: &dyn Handler<Req, Resp>,
    ) -> Result<Resp> {
        let attempts = self.config.attempts.max(1);
        let mut delay = self.config.base_delay;
        let mut attempt = 0u32;

        loop {
            if attempt > 0 {
                if let Some(reason) = ctx.err() {
                    return Err(ResilienceError::Cancelled(reason));
                }
            }

            let result = next.call(ctx, req.clone()).await;

            if !(self.retry_if)(ctx, &req, &result) || attempt + 1 >= attempts {
                if attempt > 0 {
                    if let Err(err) = &result {
                        error!(
                            attempts = attempt + 1,
                            path = ctx.path(),
                            error = %err,
                            "retry failed"
                        );
                    }
                }
                return result;
            }

            delay = self.config.next_delay(delay, attempt);
            info!(
                attempt = attempt + 1,
                max_attempts = attempts,
                delay = ?delay,
                path = ctx.path(),
                error = ?result.as_ref().err(),
                "retrying request"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                reason = ctx.done() => return Err(ResilienceError::Cancelled(reason)),
            }
            attempt += 1;
        }
    }
}

impl<Req, Resp> Middleware<Req, Resp> for Retry<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: BoxHandler<Req, Resp>) -> BoxHandler<Req, Resp> {
        Arc::new(RetryHandler {
            retry: self.clone(),
            next,
        })
    }
}

struct RetryHandler<Req, Resp> {
    retry: Retry<Req, Resp>,
    next: BoxHandler<Req, Resp>,
}

#[async_trait]
impl<Req, Resp> Handler<Req, Resp> for RetryHandler<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &CallContext, req: Req) -> Result<Resp> {
        self.retry.execute(ctx, req, self.next.as_ref()).await
    }
}

/// Retry middleware with the default predicate.
pub fn retry<Req, Resp>(config: RetryConfig) -> BoxMiddleware<Req, Resp>
where
    Req: Clone + Send + Sync + 'static,
    Resp: Send + 'static,
{
    Arc::new(Retry::new(config))
}
