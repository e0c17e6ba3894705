//! Property-Based Tests for the resilience layers

use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use steadfast_resilience::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use steadfast_resilience::clock::ManualClock;
use steadfast_resilience::context::CallContext;
use steadfast_resilience::error::ResilienceError;
use steadfast_resilience::gcra::GcraLimiter;
use steadfast_resilience::ratelimit::{Limiter, RateLimitResult};
use steadfast_resilience::retry::RetryConfig;
use steadfast_resilience::selector::{
    filter_fn, Balancer, BalancerKind, Node, RoundRobin, Selector, WeightedRandom,
};
use steadfast_resilience::sliding_window::SlidingWindowLimiter;

/// Node lists with arbitrary (possibly non-positive) weights.
pub fn arb_nodes(max: usize) -> impl Strategy<Value = Vec<Node>> {
    prop::collection::vec(-5i64..20, 1..max).prop_map(|weights| {
        weights
            .into_iter()
            .enumerate()
            .map(|(i, w)| Node::new(&format!("n{}", i), &format!("10.0.0.{}:80", i)).with_weight(w))
            .collect()
    })
}

pub fn arb_balancer() -> impl Strategy<Value = BalancerKind> {
    prop_oneof![
        Just(BalancerKind::Random),
        Just(BalancerKind::RoundRobin),
        Just(BalancerKind::WeightedRandom),
    ]
}

/// One step applied to a breaker.
#[derive(Debug, Clone, Copy)]
pub enum BreakerOp {
    Allow,
    Success,
    Failure,
    Advance(u64),
}

pub fn arb_breaker_op() -> impl Strategy<Value = BreakerOp> {
    prop_oneof![
        Just(BreakerOp::Allow),
        Just(BreakerOp::Success),
        Just(BreakerOp::Failure),
        (0u64..200).prop_map(BreakerOp::Advance),
    ]
}

proptest! {
    #[test]
    fn prop_weighted_never_picks_non_positive(nodes in arb_nodes(12), seed in any::<u64>()) {
        prop_assume!(nodes.iter().any(|n| n.weight > 0));
        let balancer = WeightedRandom::with_seed(seed);
        let ctx = CallContext::background();
        for _ in 0..50 {
            let picked = balancer.pick(&ctx, &nodes).unwrap();
            prop_assert!(picked.weight > 0, "picked {:?}", picked);
        }
    }

    #[test]
    fn prop_select_empty_is_no_available_node(kind in arb_balancer(), nodes in arb_nodes(8)) {
        let ctx = CallContext::background();
        let selector = Selector::new(kind.build());
        prop_assert!(matches!(selector.select(&ctx), Err(ResilienceError::NoAvailableNode)));

        selector.update(nodes);
        selector.apply(vec![filter_fn(|_nodes: &[Node]| Vec::new())]);
        prop_assert!(matches!(selector.select(&ctx), Err(ResilienceError::NoAvailableNode)));
    }

    #[test]
    fn prop_selected_node_is_a_candidate(kind in arb_balancer(), nodes in arb_nodes(8)) {
        let ctx = CallContext::background();
        let selector = Selector::new(kind.build());
        selector.update(nodes.clone());
        for _ in 0..20 {
            let picked = selector.select(&ctx).unwrap();
            prop_assert!(nodes.contains(&picked));
        }
    }

    #[test]
    fn prop_round_robin_visits_every_node(n in 1usize..10) {
        let nodes: Vec<Node> = (0..n)
            .map(|i| Node::new(&format!("n{}", i), "127.0.0.1:80"))
            .collect();
        let rr = RoundRobin::new();
        let ctx = CallContext::background();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..n {
            seen.insert(rr.pick(&ctx, &nodes).unwrap().id);
        }
        prop_assert_eq!(seen.len(), n);
    }

    #[test]
    fn prop_breaker_counters_stay_in_bounds(
        threshold in 1u32..6,
        max_requests in 1u32..4,
        ops in prop::collection::vec(arb_breaker_op(), 1..80),
    ) {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::with_clock(
            CircuitBreakerConfig {
                name: "prop".to_string(),
                threshold,
                timeout: Duration::from_millis(100),
                max_requests,
            },
            Arc::new(clock.clone()),
        );
        let mut consecutive_failures = 0u32;
        for op in ops {
            let before = breaker.state();
            match op {
                BreakerOp::Allow => {
                    let allowed = breaker.allow_request();
                    if before == CircuitState::Closed {
                        prop_assert!(allowed);
                    }
                }
                BreakerOp::Success => {
                    breaker.register_success();
                    consecutive_failures = 0;
                }
                BreakerOp::Failure => {
                    breaker.register_failure();
                    consecutive_failures += 1;
                    if before == CircuitState::HalfOpen {
                        prop_assert_eq!(breaker.state(), CircuitState::Open);
                    }
                    if before == CircuitState::Closed && consecutive_failures >= threshold {
                        prop_assert_eq!(breaker.state(), CircuitState::Open);
                    }
                }
                BreakerOp::Advance(ms) => clock.advance(Duration::from_millis(ms)),
            }
            match breaker.state() {
                CircuitState::Closed => prop_assert!(breaker.failure_count() < threshold),
                CircuitState::HalfOpen => prop_assert!(breaker.success_count() < max_requests),
                CircuitState::Open => {}
            }
        }
    }

    #[test]
    fn prop_sliding_window_never_exceeds_rate(
        rate in 1u32..20,
        window_ms in 10u64..500,
        gaps in prop::collection::vec(0u64..50, 1..200),
    ) {
        let clock = ManualClock::new();
        let limiter = SlidingWindowLimiter::with_clock(
            rate,
            Duration::from_millis(window_ms),
            Arc::new(clock.clone()),
        );
        let mut now_ms = 0u64;
        let mut admitted: Vec<u64> = Vec::new();
        for gap in gaps {
            clock.advance(Duration::from_millis(gap));
            now_ms += gap;
            match limiter.allow("k") {
                RateLimitResult::Allowed { .. } => admitted.push(now_ms),
                RateLimitResult::Limited { retry_after_ms } => {
                    prop_assert!(retry_after_ms >= 1);
                    prop_assert!(retry_after_ms <= window_ms + 1);
                }
            }
            let in_window = admitted.iter().filter(|&&t| now_ms - t <= window_ms).count();
            prop_assert!(in_window <= rate as usize);
        }
    }

    #[test]
    fn prop_gcra_admits_after_suggested_wait(rate in 1u32..100, burst in 0u32..10, calls in 1usize..30) {
        let clock = ManualClock::new();
        let limiter = GcraLimiter::with_clock(rate as f64, burst, Arc::new(clock.clone()));
        for _ in 0..calls {
            if let RateLimitResult::Limited { retry_after_ms } = limiter.allow("k") {
                prop_assert!(retry_after_ms >= 1);
                clock.advance(Duration::from_millis(retry_after_ms));
                prop_assert!(limiter.allow("k").is_allowed());
            }
        }
    }

    #[test]
    fn prop_retry_delays_bounded_and_monotone(
        attempts in 1u32..12,
        base_ms in 1u64..500,
        max_ms in 1u64..3000,
        backoff in any::<bool>(),
    ) {
        let config = RetryConfig {
            attempts,
            base_delay: Duration::from_millis(base_ms),
            backoff,
            max_delay: Duration::from_millis(max_ms),
        };
        let delays = config.delays();
        prop_assert_eq!(delays.len(), attempts as usize - 1);
        let cap = Duration::from_millis(base_ms.max(max_ms));
        for pair in delays.windows(2) {
            if base_ms <= max_ms {
                prop_assert!(pair[0] <= pair[1]);
            }
        }
        for d in &delays {
            prop_assert!(*d <= cap);
        }
        if let Some(first) = delays.first() {
            prop_assert_eq!(*first, Duration::from_millis(base_ms));
        }
    }
}
