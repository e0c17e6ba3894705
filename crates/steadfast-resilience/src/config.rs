//! Aggregate configuration for a full resilience pipeline.
//!
//! [`ResilienceConfig`] bundles the settings of every layer so one document
//! can describe a client. [`ResilienceConfig::build_pipeline`] turns it into
//! the standard `Retry -> CircuitBreaker -> RateLimiter` chain plus a
//! [`Selector`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::clock::Clock;
use crate::error::Result;
use crate::middleware::{chain, BoxHandler, BoxMiddleware};
use crate::ratelimit::{Limiter, RateLimitMiddleware, RateLimiterConfig};
use crate::retry::{Retry, RetryConfig};
use crate::selector::{Selector, SelectorConfig};

/// Serde adapter storing a `Duration` as whole milliseconds.
pub mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Writes the duration as a millisecond count.
    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    /// Reads a millisecond count.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Settings for every layer of a client's resilience pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    /// Node selection.
    pub selector: SelectorConfig,
    /// Circuit breaker.
    pub breaker: CircuitBreakerConfig,
    /// Rate limiter.
    pub limiter: RateLimiterConfig,
    /// Retry executor.
    pub retry: RetryConfig,
}

impl ResilienceConfig {
    /// Validates every section.
    pub fn validate(&self) -> Result<()> {
        self.breaker.validate()?;
        self.limiter.validate()?;
        self.retry.validate()?;
        Ok(())
    }

    /// Builds the selector and the `Retry -> CircuitBreaker -> RateLimiter` chain.
    pub fn build_pipeline<Req, Resp>(&self, clock: Arc<dyn Clock>) -> Result<Pipeline<Req, Resp>>
    where
        Req: Clone + Send + Sync + 'static,
        Resp: Send + 'static,
    {
        self.validate()?;

        let selector = Arc::new(Selector::from_config(&self.selector));
        let breaker = Arc::new(CircuitBreaker::with_clock(
            self.breaker.clone(),
            Arc::clone(&clock),
        ));
        let limiter = self.limiter.build(clock);

        let retry: BoxMiddleware<Req, Resp> = Arc::new(Retry::new(self.retry.clone()));
        let limit: BoxMiddleware<Req, Resp> =
            Arc::new(RateLimitMiddleware::new(Arc::clone(&limiter)));
        let middleware = chain(vec![retry, breaker.middleware(), limit]);

        debug!(
            breaker = %self.breaker.name,
            balancer = ?self.selector.balancer,
            attempts = self.retry.attempts,
            "resilience pipeline built"
        );

        Ok(Pipeline {
            selector,
            breaker,
            limiter,
            middleware,
        })
    }
}

/// A built pipeline: the selector plus the shared middleware chain.
pub struct Pipeline<Req, Resp> {
    selector: Arc<Selector>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<dyn Limiter>,
    middleware: BoxMiddleware<Req, Resp>,
}

impl<Req, Resp> Pipeline<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    /// The selector; the discovery side pushes node lists into it.
    pub fn selector(&self) -> &Arc<Selector> {
        &self.selector
    }

    /// The breaker guarding the dependency.
    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// The limiter behind the rate-limit layer.
    pub fn limiter(&self) -> &Arc<dyn Limiter> {
        &self.limiter
    }

    /// The composed middleware.
    pub fn middleware(&self) -> &BoxMiddleware<Req, Resp> {
        &self.middleware
    }

    /// Wraps the transport call with the whole chain.
    pub fn wrap(&self, transport: BoxHandler<Req, Resp>) -> BoxHandler<Req, Resp> {
        self.middleware.wrap(transport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuitbreaker::CircuitState;
    use crate::clock::ManualClock;
    use crate::context::{CallContext, CLIENT_IP_KEY};
    use crate::error::{ResilienceError, StatusError};
    use crate::middleware::handler_fn;
    use crate::ratelimit::RateLimitAlgorithm;
    use crate::selector::{BalancerKind, Node};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn test_default_config_is_valid() {
        let config = ResilienceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.selector.balancer, BalancerKind::Random);
        assert_eq!(config.retry.attempts, 3);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: ResilienceConfig = serde_json::from_str(
            r#"{
                "selector": {"balancer": "weighted_random"},
                "breaker": {"name": "orders", "threshold": 3, "timeout": 100, "max_requests": 2},
                "limiter": {"algorithm": {"type": "gcra", "rate": 50.0, "burst": 10}}
            }"#,
        )
        .unwrap();
        assert_eq!(config.selector.balancer, BalancerKind::WeightedRandom);
        assert_eq!(config.breaker.name, "orders");
        assert_eq!(config.breaker.timeout, Duration::from_millis(100));
        assert_eq!(
            config.limiter.algorithm,
            RateLimitAlgorithm::Gcra {
                rate: 50.0,
                burst: 10
            }
        );
        assert_eq!(config.retry, RetryConfig::default());
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = ResilienceConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: ResilienceConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_invalid_section_rejected() {
        let mut config = ResilienceConfig::default();
        config.retry.attempts = 0;
        let err = config
            .build_pipeline::<(), ()>(Arc::new(ManualClock::new()))
            .err()
            .unwrap();
        assert!(matches!(err, ResilienceError::InvalidConfig { ref field, .. } if field == "retry.attempts"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_trips_breaker_through_retries() {
        let mut config = ResilienceConfig::default();
        config.breaker.threshold = 3;
        config.selector.balancer = BalancerKind::RoundRobin;
        let clock = ManualClock::new();
        let pipeline = config
            .build_pipeline::<String, String>(Arc::new(clock.clone()))
            .unwrap();
        pipeline
            .selector()
            .update(vec![Node::new("a", "10.0.0.1:9000"), Node::new("b", "10.0.0.2:9000")]);

        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let transport = handler_fn(move |_ctx: CallContext, _req: String| {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(StatusError::service_unavailable("DOWN", "down").into())
            }
        });
        let client = pipeline.wrap(transport);
        let ctx = CallContext::background().with_value(CLIENT_IP_KEY, "10.9.9.9");

        let node = pipeline.selector().select(&ctx).unwrap();
        assert_eq!(node.id, "b");

        // Three attempts, three failures: the breaker opens on the last one.
        let err = client.call(&ctx, node.address.clone()).await.unwrap_err();
        assert_eq!(err.code(), 503);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);

        // Open breaker fails fast and is not retried.
        let err = client.call(&ctx, node.address).await.unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
