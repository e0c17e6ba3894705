//! Circuit breaker for isolating a failing dependency.
//!
//! # How It Works
//!
//! The circuit breaker has three states:
//!
//! 1. **Closed**: Normal operation. Requests pass through. Consecutive failures are counted.
//! 2. **Open**: Requests are rejected with [`ResilienceError::CircuitOpen`] without running.
//!    Once `timeout` has passed since the last failure, the next check moves to half-open.
//! 3. **HalfOpen**: Up to `max_requests` trial calls are let through. That many
//!    consecutive successes close the circuit; any failure reopens it.
//!
//! There is no timer: the Open to HalfOpen move happens inside
//! [`CircuitBreaker::allow_request`] on the calling thread. All state lives
//! behind one mutex per breaker.
//!
//! # Example
//!
//! ```
//! use steadfast_resilience::circuitbreaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
//!
//! if breaker.allow_request() {
//!     // perform the call, then report the outcome
//!     breaker.register_success();
//! }
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! ```

use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{system_clock, Clock};
use crate::config::duration_ms;
use crate::context::CallContext;
use crate::error::{ResilienceError, Result};
use crate::middleware::{BoxHandler, BoxMiddleware, Handler, Middleware};

/// Default failure threshold: consecutive failures required to open the circuit.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
/// Default number of half-open trial successes required to close the circuit.
pub const DEFAULT_MAX_REQUESTS: u32 = 3;
/// Default open timeout in milliseconds before a trial call is allowed.
pub const DEFAULT_OPEN_TIMEOUT_MS: u64 = 30_000;

/// Represents the state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation; requests are allowed through.
    Closed,
    /// Circuit is open; requests are rejected.
    Open,
    /// Testing recovery; a limited number of trial requests are allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for the circuit breaker.
///
/// # Default Values
///
/// - `name`: "default"
/// - `threshold`: 5 consecutive failures to open
/// - `timeout`: 30 seconds
/// - `max_requests`: 3 trial successes to close
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Logical dependency name, used in logs, errors and observer callbacks.
    pub name: String,
    /// Consecutive failures while closed that open the circuit.
    pub threshold: u32,
    /// Time since the last failure before an open circuit lets a trial through.
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// Trial calls allowed, and successes required, while half-open.
    pub max_requests: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            threshold: DEFAULT_FAILURE_THRESHOLD,
            timeout: Duration::from_millis(DEFAULT_OPEN_TIMEOUT_MS),
            max_requests: DEFAULT_MAX_REQUESTS,
        }
    }
}

impl CircuitBreakerConfig {
    /// Rejects settings that would leave the breaker unable to open or close.
    pub fn validate(&self) -> Result<()> {
        if self.threshold == 0 {
            return Err(ResilienceError::invalid_config(
                "breaker.threshold",
                "must be at least 1",
            ));
        }
        if self.max_requests == 0 {
            return Err(ResilienceError::invalid_config(
                "breaker.max_requests",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Callback fired on every state transition with `(name, from, to)`.
pub type StateObserver = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
}

type Transition = Option<(CircuitState, CircuitState)>;

impl BreakerState {
    fn move_to(&mut self, to: CircuitState) -> Transition {
        let from = self.state;
        self.state = to;
        if from == to {
            None
        } else {
            Some((from, to))
        }
    }
}

/// A thread-safe circuit breaker guarding one logical dependency.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    observer: Option<ObserverQueue>,
    inner: Mutex<BreakerState>,
}

/// Feeds transitions, in the order they happened, to the observer thread.
struct ObserverQueue {
    tx: Mutex<mpsc::Sender<(CircuitState, CircuitState)>>,
}

impl ObserverQueue {
    fn start(name: String, observer: StateObserver) -> Option<Self> {
        let (tx, rx) = mpsc::channel::<(CircuitState, CircuitState)>();
        let spawned = std::thread::Builder::new()
            .name(format!("breaker-{}", name))
            .spawn(move || {
                // Ends once the breaker, and with it the sender, is dropped.
                for (from, to) in rx {
                    observer(&name, from, to);
                }
            });
        match spawned {
            Ok(_) => Some(Self { tx: Mutex::new(tx) }),
            Err(e) => {
                warn!(error = %e, "failed to start circuit breaker observer thread");
                None
            }
        }
    }

    fn push(&self, from: CircuitState, to: CircuitState) {
        let tx = self.tx.lock().unwrap_or_else(|e| e.into_inner());
        let _ = tx.send((from, to));
    }
}

impl CircuitBreaker {
    /// Creates a closed breaker reading the system clock.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Creates a closed breaker reading `clock`.
    pub fn with_clock(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            observer: None,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
            }),
        }
    }

    /// Registers the state-change observer.
    ///
    /// The observer runs on one dedicated thread per breaker and sees
    /// transitions in the order they happened. It is never called under the
    /// breaker lock, so it may call back into the breaker.
    pub fn on_state_change<F>(mut self, observer: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.observer = ObserverQueue::start(self.config.name.clone(), Arc::new(observer));
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Callers hold the state lock, so transitions are queued in the order they happened.
    fn notify(&self, transition: Transition) {
        let Some((from, to)) = transition else {
            return;
        };
        info!(
            name = %self.config.name,
            from = %from,
            to = %to,
            "circuit breaker state changed"
        );
        if let Some(queue) = &self.observer {
            queue.push(from, to);
        }
    }

    /// Checks whether a call may proceed.
    ///
    /// While open, this is where the timeout is evaluated and the breaker moves
    /// to half-open. While half-open, at most `max_requests` calls are allowed
    /// per episode; outcomes must be reported to make progress.
    pub fn allow_request(&self) -> bool {
        let mut st = self.lock();
        let (allowed, transition) = match st.state {
            CircuitState::Closed => (true, None),
            CircuitState::Open => {
                let now = self.clock.now();
                let elapsed = st
                    .last_failure
                    .map(|at| now.saturating_duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.timeout {
                    st.success_count = 0;
                    (true, st.move_to(CircuitState::HalfOpen))
                } else {
                    (false, None)
                }
            }
            CircuitState::HalfOpen => (st.success_count < self.config.max_requests, None),
        };
        self.notify(transition);
        allowed
    }

    /// Records a successful call.
    ///
    /// - Closed: clears the consecutive failure count.
    /// - HalfOpen: counts the success; after `max_requests` of them the circuit closes
    ///   and both counters reset.
    pub fn register_success(&self) {
        let mut st = self.lock();
        let transition = match st.state {
            CircuitState::Closed => {
                st.failure_count = 0;
                None
            }
            CircuitState::HalfOpen => {
                st.success_count += 1;
                if st.success_count >= self.config.max_requests {
                    st.failure_count = 0;
                    st.success_count = 0;
                    st.move_to(CircuitState::Closed)
                } else {
                    None
                }
            }
            CircuitState::Open => None,
        };
        self.notify(transition);
    }

    /// Records a failed call.
    ///
    /// - Closed: counts the failure; at `threshold` the circuit opens.
    /// - HalfOpen: the circuit reopens immediately.
    pub fn register_failure(&self) {
        let mut st = self.lock();
        st.failure_count = st.failure_count.saturating_add(1);
        st.last_failure = Some(self.clock.now());
        let transition = match st.state {
            CircuitState::Closed if st.failure_count >= self.config.threshold => {
                st.move_to(CircuitState::Open)
            }
            CircuitState::HalfOpen => {
                st.success_count = 0;
                st.move_to(CircuitState::Open)
            }
            _ => None,
        };
        self.notify(transition);
    }

    /// Runs `next` if the breaker allows it and records the outcome.
    ///
    /// Control signals raised further down the chain (rate limiting, cancellation,
    /// no node) say nothing about the dependency's health and are not recorded.
    pub async fn execute<Req, Resp>(
        &self,
        ctx: &CallContext,
        req: Req,
        next: &dyn Handler<Req, Resp>,
    ) -> Result<Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        if !self.allow_request() {
            warn!(
                name = %self.config.name,
                state = %self.state(),
                path = ctx.path(),
                "circuit breaker open, request rejected"
            );
            return Err(ResilienceError::CircuitOpen {
                name: self.config.name.clone(),
            });
        }

        let result = next.call(ctx, req).await;
        match &result {
            Ok(_) => self.register_success(),
            Err(err) if err.is_control_signal() => {}
            Err(_) => self.register_failure(),
        }
        result
    }

    /// Returns the current state without evaluating the open timeout.
    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Consecutive failures recorded while closed.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Successes recorded in the current half-open episode.
    pub fn success_count(&self) -> u32 {
        self.lock().success_count
    }

    /// The breaker's name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Forces the breaker closed and clears all counters.
    pub fn reset(&self) {
        let mut st = self.lock();
        st.failure_count = 0;
        st.success_count = 0;
        st.last_failure = None;
        let transition = st.move_to(CircuitState::Closed);
        self.notify(transition);
    }

    /// Middleware that runs every call through [`CircuitBreaker::execute`].
    pub fn middleware<Req, Resp>(self: &Arc<Self>) -> BoxMiddleware<Req, Resp>
    where
        Req: Send + 'static,
        Resp: Send + 'static,
    {
        Arc::new(BreakerLayer {
            breaker: Arc::clone(self),
        })
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &*self.lock())
            .field("observer", &self.observer.is_some())
            .finish()
    }
}

struct BreakerLayer {
    breaker: Arc<CircuitBreaker>,
}

impl<Req, Resp> Middleware<Req, Resp> for BreakerLayer
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    fn wrap(&self, next: BoxHandler<Req, Resp>) -> BoxHandler<Req, Resp> {
        Arc::new(BreakerHandler {
            breaker: Arc::clone(&self.breaker),
            next,
        })
    }
}

struct BreakerHandler<Req, Resp> {
    breaker: Arc<CircuitBreaker>,
    next: BoxHandler<Req, Resp>,
}

#[async_trait]
impl<Req, Resp> Handler<Req, Resp> for BreakerHandler<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    async fn call(&self, ctx: &CallContext, req: Req) -> Result<Resp> {
        self.breaker.execute(ctx, req, self.next.as_ref()).await
    }
}

/// Builds a fresh breaker and returns only its middleware.
pub fn circuit_breaker<Req, Resp>(config: CircuitBreakerConfig) -> BoxMiddleware<Req, Resp>
where
    Req: Send + 'static,
    Resp: Send + 'static,
{
    Arc::new(CircuitBreaker::new(config)).middleware()
}
