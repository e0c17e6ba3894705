#![warn(missing_docs)]

//! Steadfast client-side resilience: node selection, circuit breaking, rate limiting and retry
//! as composable call middleware.

pub mod circuitbreaker;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod gcra;
pub mod middleware;
pub mod ratelimit;
pub mod retry;
pub mod selector;
pub mod sliding_window;
pub mod token_bucket;

pub use circuitbreaker::{circuit_breaker, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Pipeline, ResilienceConfig};
pub use context::{new_cancel_pair, CallContext, CancelHandle, CancelReason, CancelToken};
pub use error::{ResilienceError, Result, StatusError};
pub use gcra::GcraLimiter;
pub use middleware::{chain, handler_fn, BoxHandler, BoxMiddleware, Chain, Handler, Middleware};
pub use ratelimit::{Limiter, RateLimitMiddleware, RateLimitResult, RateLimiterConfig};
pub use retry::{retry, Retry, RetryConfig};
pub use selector::{Balancer, BalancerKind, Node, Selector};
pub use sliding_window::SlidingWindowLimiter;
pub use token_bucket::TokenBucketLimiter;
