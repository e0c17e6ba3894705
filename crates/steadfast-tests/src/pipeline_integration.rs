//! Pipeline Integration Tests
//!
//! Select a node, then send the call through Retry -> CircuitBreaker -> RateLimiter
//! into a simulated transport.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use steadfast_resilience::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
    use steadfast_resilience::clock::ManualClock;
    use steadfast_resilience::config::ResilienceConfig;
    use steadfast_resilience::context::{CallContext, CancelReason};
    use steadfast_resilience::error::ResilienceError;
    use steadfast_resilience::middleware::{chain, BoxMiddleware};
    use steadfast_resilience::ratelimit::{RateLimitAlgorithm, RateLimitMiddleware};
    use steadfast_resilience::retry::{Retry, RetryConfig};
    use steadfast_resilience::selector::{filter_fn, BalancerKind, Node, Selector, WeightedRandom};
    use steadfast_resilience::token_bucket::TokenBucketLimiter;

    use crate::chaos::{FaultType, Request, Response, SimulatedTransport};
    use crate::harness::{init_tracing, request_context, LogCapture, TestCluster};

    fn config_json() -> &'static str {
        r#"{
            "selector": {"balancer": "round_robin"},
            "breaker": {"name": "echo", "threshold": 3, "timeout": 100, "max_requests": 2},
            "limiter": {"algorithm": {"type": "token_bucket", "rate": 10.0, "capacity": 5.0}},
            "retry": {"attempts": 3, "base_delay": 10, "backoff": true, "max_delay": 100}
        }"#
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_round_robin() -> anyhow::Result<()> {
        init_tracing();
        let cluster = TestCluster::three_node();
        let config: ResilienceConfig = serde_json::from_str(config_json())?;
        let clock = ManualClock::new();
        let pipeline = config.build_pipeline::<Request, Response>(Arc::new(clock.clone()))?;
        let nodes = cluster.nodes()?;
        pipeline.selector().update(nodes.clone());

        let transport = Arc::new(SimulatedTransport::new(&nodes, 7));
        let client = pipeline.wrap(transport.handler());

        let mut served = Vec::new();
        for i in 0..3 {
            let ctx = request_context("/echo", &format!("10.0.0.{}", i));
            let node = pipeline.selector().select(&ctx)?;
            let resp = client.call(&ctx, Request::new(node, "hi")).await?;
            served.push(resp.node_id);
        }
        assert_eq!(served, vec!["node-1", "node-2", "node-0"]);
        assert_eq!(transport.total_calls(), 3);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_are_retried() -> anyhow::Result<()> {
        let cluster = TestCluster::single_node();
        let config: ResilienceConfig = serde_json::from_str(config_json())?;
        let pipeline = config.build_pipeline::<Request, Response>(Arc::new(ManualClock::new()))?;
        let nodes = cluster.nodes()?;
        pipeline.selector().update(nodes.clone());
        let transport = Arc::new(SimulatedTransport::new(&nodes, 7));
        transport.inject("node-0", FaultType::FailNext { count: 2 })?;
        let client = pipeline.wrap(transport.handler());

        let ctx = request_context("/echo", "10.0.0.1");
        let node = pipeline.selector().select(&ctx)?;
        let start = tokio::time::Instant::now();
        let resp = client.call(&ctx, Request::new(node, "retry me")).await?;
        assert_eq!(resp.body, "retry me");
        assert_eq!(transport.calls_to("node-0"), 3);
        // 10ms then 15ms between attempts.
        assert_eq!(start.elapsed(), Duration::from_millis(25));
        // Two failures then a success: the breaker is closed with a clean count.
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
        assert_eq!(pipeline.breaker().failure_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_lifecycle_through_pipeline() -> anyhow::Result<()> {
        let cluster = TestCluster::single_node();
        let config: ResilienceConfig = serde_json::from_str(config_json())?;
        let clock = ManualClock::new();
        let pipeline = config.build_pipeline::<Request, Response>(Arc::new(clock.clone()))?;
        let nodes = cluster.nodes()?;
        let transport = Arc::new(SimulatedTransport::new(&nodes, 7));
        let crash = transport.inject("node-0", FaultType::NodeCrash)?;
        let client = pipeline.wrap(transport.handler());
        let node = nodes[0].clone();

        // One logical call, three attempts, three failures: open.
        let ctx = request_context("/echo", "10.0.0.1");
        let err = client.call(&ctx, Request::new(node.clone(), "x")).await.unwrap_err();
        assert!(matches!(err, ResilienceError::Call(_)));
        assert_eq!(pipeline.breaker().state(), CircuitState::Open);
        assert_eq!(transport.calls_to("node-0"), 3);

        // Fails fast while open.
        let err = client.call(&ctx, Request::new(node.clone(), "x")).await.unwrap_err();
        assert!(matches!(err, ResilienceError::CircuitOpen { ref name } if name == "echo"));
        assert_eq!(transport.calls_to("node-0"), 3);

        // After the timeout two trial successes close it again.
        transport.heal(crash);
        clock.advance(Duration::from_millis(100));
        client.call(&ctx, Request::new(node.clone(), "trial 1")).await?;
        assert_eq!(pipeline.breaker().state(), CircuitState::HalfOpen);
        client.call(&ctx, Request::new(node, "trial 2")).await?;
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);
        assert_eq!(pipeline.breaker().failure_count(), 0);
        assert_eq!(pipeline.breaker().success_count(), 0);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_calls_are_not_retried_and_do_not_trip_breaker() -> anyhow::Result<()> {
        let cluster = TestCluster::single_node();
        let config: ResilienceConfig = serde_json::from_str(config_json())?;
        let pipeline = config.build_pipeline::<Request, Response>(Arc::new(ManualClock::new()))?;
        let nodes = cluster.nodes()?;
        let transport = Arc::new(SimulatedTransport::new(&nodes, 7));
        let client = pipeline.wrap(transport.handler());

        let ctx = request_context("/echo", "10.0.0.42");
        for _ in 0..5 {
            client.call(&ctx, Request::new(nodes[0].clone(), "x")).await?;
        }
        for _ in 0..5 {
            let err = client
                .call(&ctx, Request::new(nodes[0].clone(), "x"))
                .await
                .unwrap_err();
            match err {
                ResilienceError::RateLimited { key, retry_after_ms } => {
                    assert_eq!(key, "10.0.0.42");
                    assert_eq!(retry_after_ms, 100);
                }
                other => anyhow::bail!("unexpected error: {other}"),
            }
        }
        assert_eq!(transport.total_calls(), 5);
        assert_eq!(pipeline.breaker().state(), CircuitState::Closed);

        // A different client key still has its full bucket.
        let other = request_context("/echo", "10.0.0.43");
        client.call(&other, Request::new(nodes[0].clone(), "x")).await?;
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_errors_pass_through_unchanged() -> anyhow::Result<()> {
        let cluster = TestCluster::single_node();
        let config: ResilienceConfig = serde_json::from_str(config_json())?;
        let pipeline = config.build_pipeline::<Request, Response>(Arc::new(ManualClock::new()))?;
        let nodes = cluster.nodes()?;
        let transport = Arc::new(SimulatedTransport::new(&nodes, 7));
        transport.inject("node-0", FaultType::Status { code: 404 })?;
        let client = pipeline.wrap(transport.handler());

        let err = client
            .call(&request_context("/echo", "1.1.1.1"), Request::new(nodes[0].clone(), "x"))
            .await
            .unwrap_err();
        match err {
            ResilienceError::Status(status) => {
                assert_eq!(status.code, 404);
                assert_eq!(status.reason, "INJECTED");
            }
            other => anyhow::bail!("unexpected error: {other}"),
        }
        assert_eq!(transport.calls_to("node-0"), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_returns_promptly() -> anyhow::Result<()> {
        let nodes = TestCluster::single_node().nodes()?;
        let transport = Arc::new(SimulatedTransport::new(&nodes, 7));
        transport.inject("node-0", FaultType::NodeCrash)?;
        let retry: BoxMiddleware<Request, Response> = Arc::new(Retry::new(RetryConfig {
            attempts: 3,
            base_delay: Duration::from_secs(30),
            ..Default::default()
        }));
        let client = chain(vec![retry]).wrap(transport.handler());

        let (ctx, handle) = request_context("/echo", "10.0.0.1").with_cancel();
        let call = {
            let client = Arc::clone(&client);
            let node = nodes[0].clone();
            tokio::spawn(async move { client.call(&ctx, Request::new(node, "x")).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        handle.cancel(CancelReason::ClientDisconnected);

        let start = tokio::time::Instant::now();
        let err = call.await?.unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            err,
            ResilienceError::Cancelled(CancelReason::ClientDisconnected)
        ));
        assert_eq!(err.code(), 499);
        assert_eq!(transport.calls_to("node-0"), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_failover_with_zone_filter() -> anyhow::Result<()> {
        let nodes = TestCluster::three_node().nodes()?;
        let selector = Selector::new(Arc::new(WeightedRandom::with_seed(11))).with_filters(vec![
            filter_fn(|nodes: &[Node]| {
                nodes
                    .iter()
                    .filter(|n| n.metadata.get("zone").map(String::as_str) == Some("a"))
                    .cloned()
                    .collect()
            }),
        ]);
        selector.update(nodes);
        let ctx = CallContext::background();
        for _ in 0..100 {
            let picked = selector.select(&ctx)?;
            assert!(picked.id == "node-0" || picked.id == "node-2");
        }

        // Discovery drops every zone-a node: the filter leaves nothing.
        selector.update(TestCluster::uniform("echo", 2).nodes()?.into_iter().skip(1).collect());
        assert!(matches!(
            selector.select(&ctx),
            Err(ResilienceError::NoAvailableNode)
        ));
        Ok(())
    }

    #[test]
    fn test_weighted_distribution_scenario() -> anyhow::Result<()> {
        let nodes = TestCluster::weighted("echo", &[1, 1, 8]).nodes()?;
        let selector = Selector::new(Arc::new(WeightedRandom::with_seed(99)));
        selector.update(nodes);
        let ctx = CallContext::background();
        let mut heavy = 0;
        for _ in 0..10_000 {
            if selector.select(&ctx)?.id == "node-2" {
                heavy += 1;
            }
        }
        let share = heavy as f64 / 10_000.0;
        assert!((0.75..=0.85).contains(&share), "share was {share}");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_hand_built_chain_matches_config_pipeline() -> anyhow::Result<()> {
        let clock = ManualClock::new();
        let nodes = TestCluster::single_node().nodes()?;
        let transport = Arc::new(SimulatedTransport::new(&nodes, 7));
        let breaker = Arc::new(CircuitBreaker::with_clock(
            CircuitBreakerConfig {
                name: "manual".to_string(),
                threshold: 1,
                ..Default::default()
            },
            Arc::new(clock.clone()),
        ));
        let limiter = Arc::new(TokenBucketLimiter::with_clock(
            1.0,
            1.0,
            Arc::new(clock.clone()),
        ));
        let retry: BoxMiddleware<Request, Response> = Arc::new(Retry::new(RetryConfig::default()));
        let limit: BoxMiddleware<Request, Response> = Arc::new(RateLimitMiddleware::new(limiter));
        let client = chain(vec![retry, breaker.middleware(), limit]).wrap(transport.handler());

        let ctx = request_context("/echo", "10.0.0.1");
        client.call(&ctx, Request::new(nodes[0].clone(), "x")).await?;
        // Second call is limited once; the default predicate does not retry it.
        let err = client
            .call(&ctx, Request::new(nodes[0].clone(), "x"))
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::RateLimited { .. }));
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(transport.total_calls(), 1);
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_pipeline_logs() -> anyhow::Result<()> {
        let (logs, _guard) = LogCapture::install();
        let mut config = ResilienceConfig::default();
        config.breaker.name = "logged".to_string();
        config.breaker.threshold = 2;
        config.retry.attempts = 2;
        config.limiter.algorithm = RateLimitAlgorithm::TokenBucket {
            rate: 1.0,
            capacity: 3.0,
        };
        config.selector.balancer = BalancerKind::Random;
        let pipeline = config.build_pipeline::<Request, Response>(Arc::new(ManualClock::new()))?;
        let nodes = TestCluster::single_node().nodes()?;
        let transport = Arc::new(SimulatedTransport::new(&nodes, 7));
        transport.inject("node-0", FaultType::Status { code: 503 })?;
        let client = pipeline.wrap(transport.handler());

        let ctx = request_context("/logged", "10.0.0.1");
        let _ = client.call(&ctx, Request::new(nodes[0].clone(), "x")).await;
        let _ = client.call(&ctx, Request::new(nodes[0].clone(), "x")).await;

        assert_eq!(logs.lines_containing("retrying request").len(), 1);
        assert_eq!(logs.lines_containing("retry failed").len(), 1);
        assert_eq!(logs.lines_containing("circuit breaker state changed").len(), 1);
        assert_eq!(logs.lines_containing("circuit breaker open").len(), 1);
        assert!(!logs.lines_containing("rate limit approaching").is_empty());
        assert!(logs.contents().contains("path=\"/logged\""));
        Ok(())
    }
}
