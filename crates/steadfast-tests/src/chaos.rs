//! Chaos/Fault Injection Utilities - a simulated transport whose nodes can be made to fail

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use thiserror::Error;

use steadfast_resilience::context::CallContext;
use steadfast_resilience::error::{ResilienceError, StatusError};
use steadfast_resilience::middleware::{handler_fn, BoxHandler};
use steadfast_resilience::selector::Node;

pub type NodeId = String;

#[derive(Error, Debug)]
pub enum ChaosError {
    #[error("unknown node: {0}")]
    UnknownNode(String),
    #[error("connection refused by {0}")]
    ConnectionRefused(String),
    #[error("request to {0} lost")]
    PacketLost(String),
}

/// Type of fault to inject
#[derive(Debug, Clone, PartialEq)]
pub enum FaultType {
    /// Node refuses every connection
    NodeCrash,
    /// Every call to the node is delayed
    LatencySpike { delay_ms: u64 },
    /// Node answers with an error status
    Status { code: u16 },
    /// Calls fail with the given probability (0.0-1.0)
    PacketLoss { rate: f64 },
    /// The next `count` calls fail, then the node recovers
    FailNext { count: u32 },
}

impl FaultType {
    pub fn description(&self) -> String {
        match self {
            FaultType::NodeCrash => "node crash".to_string(),
            FaultType::LatencySpike { delay_ms } => format!("latency spike: {}ms", delay_ms),
            FaultType::Status { code } => format!("status {}", code),
            FaultType::PacketLoss { rate } => format!("packet loss: {}%", rate * 100.0),
            FaultType::FailNext { count } => format!("fail next {} calls", count),
        }
    }
}

/// Opaque handle to remove a fault
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FaultHandle(u64);

/// A request addressed to the node the selector picked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub node: Node,
    pub body: String,
}

impl Request {
    pub fn new(node: Node, body: &str) -> Self {
        Self {
            node,
            body: body.to_string(),
        }
    }
}

/// The simulated node's answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub node_id: NodeId,
    pub body: String,
}

enum Outcome {
    Ok,
    Fail(ResilienceError),
}

/// In-memory stand-in for the network: echoes requests unless a fault applies.
pub struct SimulatedTransport {
    known: HashSet<NodeId>,
    faults: Mutex<HashMap<FaultHandle, (NodeId, FaultType)>>,
    next_handle: AtomicU64,
    rng: Mutex<StdRng>,
    calls: Mutex<HashMap<NodeId, u64>>,
}

impl SimulatedTransport {
    pub fn new(nodes: &[Node], seed: u64) -> Self {
        Self {
            known: nodes.iter().map(|n| n.id.clone()).collect(),
            faults: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(0),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            calls: Mutex::new(HashMap::new()),
        }
    }

    /// Inject a fault on a node and get a handle to remove it
    pub fn inject(&self, node: &str, fault: FaultType) -> Result<FaultHandle, ChaosError> {
        if !self.known.contains(node) {
            return Err(ChaosError::UnknownNode(node.to_string()));
        }
        let handle = FaultHandle(self.next_handle.fetch_add(1, Ordering::Relaxed));
        self.faults
            .lock()
            .unwrap()
            .insert(handle, (node.to_string(), fault));
        Ok(handle)
    }

    /// Remove a fault. Returns false if it was already gone.
    pub fn heal(&self, handle: FaultHandle) -> bool {
        self.faults.lock().unwrap().remove(&handle).is_some()
    }

    pub fn heal_all(&self) {
        self.faults.lock().unwrap().clear();
    }

    pub fn active_faults(&self) -> Vec<FaultType> {
        self.faults
            .lock()
            .unwrap()
            .values()
            .map(|(_, f)| f.clone())
            .collect()
    }

    pub fn calls_to(&self, node: &str) -> u64 {
        self.calls.lock().unwrap().get(node).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> u64 {
        self.calls.lock().unwrap().values().sum()
    }

    fn evaluate(&self, node: &str) -> (Option<Duration>, Outcome) {
        let mut faults = self.faults.lock().unwrap();
        let mut delay = None;
        let mut outcome = Outcome::Ok;
        let mut spent = Vec::new();
        for (handle, (target, fault)) in faults.iter_mut() {
            if target.as_str() != node {
                continue;
            }
            match fault {
                FaultType::NodeCrash => {
                    outcome = Outcome::Fail(ResilienceError::call(ChaosError::ConnectionRefused(
                        node.to_string(),
                    )));
                }
                FaultType::LatencySpike { delay_ms } => {
                    delay = Some(Duration::from_millis(*delay_ms));
                }
                FaultType::Status { code } => {
                    outcome = Outcome::Fail(
                        StatusError::new(*code, "INJECTED", &format!("{} injected", code)).into(),
                    );
                }
                FaultType::PacketLoss { rate } => {
                    if self.rng.lock().unwrap().gen::<f64>() < *rate {
                        outcome = Outcome::Fail(ResilienceError::call(ChaosError::PacketLost(
                            node.to_string(),
                        )));
                    }
                }
                FaultType::FailNext { count } => {
                    if *count > 0 {
                        *count -= 1;
                        outcome = Outcome::Fail(ResilienceError::call(
                            ChaosError::ConnectionRefused(node.to_string()),
                        ));
                    }
                    if *count == 0 {
                        spent.push(*handle);
                    }
                }
            }
        }
        for handle in spent {
            faults.remove(&handle);
        }
        (delay, outcome)
    }

    pub async fn dispatch(&self, req: Request) -> steadfast_resilience::Result<Response> {
        *self
            .calls
            .lock()
            .unwrap()
            .entry(req.node.id.clone())
            .or_insert(0) += 1;

        let (delay, outcome) = self.evaluate(&req.node.id);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match outcome {
            Outcome::Ok => Ok(Response {
                node_id: req.node.id,
                body: req.body,
            }),
            Outcome::Fail(err) => Err(err),
        }
    }

    /// The transport as the innermost handler of a chain.
    pub fn handler(self: &Arc<Self>) -> BoxHandler<Request, Response> {
        let transport = Arc::clone(self);
        handler_fn(move |_ctx: CallContext, req: Request| {
            let transport = Arc::clone(&transport);
            async move { transport.dispatch(req).await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes() -> Vec<Node> {
        vec![Node::new("n1", "10.0.0.1:80"), Node::new("n2", "10.0.0.2:80")]
    }

    #[test]
    fn test_fault_description() {
        assert_eq!(FaultType::NodeCrash.description(), "node crash");
        assert_eq!(
            FaultType::LatencySpike { delay_ms: 100 }.description(),
            "latency spike: 100ms"
        );
        assert_eq!(
            FaultType::PacketLoss { rate: 0.5 }.description(),
            "packet loss: 50%"
        );
    }

    #[test]
    fn test_inject_unknown_node() {
        let transport = SimulatedTransport::new(&nodes(), 1);
        assert!(matches!(
            transport.inject("n9", FaultType::NodeCrash),
            Err(ChaosError::UnknownNode(_))
        ));
    }

    #[tokio::test]
    async fn test_echo_without_faults() {
        let transport = SimulatedTransport::new(&nodes(), 1);
        let resp = transport
            .dispatch(Request::new(nodes()[0].clone(), "ping"))
            .await
            .unwrap();
        assert_eq!(resp.node_id, "n1");
        assert_eq!(resp.body, "ping");
        assert_eq!(transport.calls_to("n1"), 1);
    }

    #[tokio::test]
    async fn test_crash_and_heal() {
        let transport = SimulatedTransport::new(&nodes(), 1);
        let handle = transport.inject("n1", FaultType::NodeCrash).unwrap();
        let n1 = nodes()[0].clone();
        assert!(transport.dispatch(Request::new(n1.clone(), "x")).await.is_err());
        // Other nodes are unaffected.
        assert!(transport
            .dispatch(Request::new(nodes()[1].clone(), "x"))
            .await
            .is_ok());
        assert!(transport.heal(handle));
        assert!(!transport.heal(handle));
        assert!(transport.dispatch(Request::new(n1, "x")).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_next_recovers() {
        let transport = SimulatedTransport::new(&nodes(), 1);
        transport
            .inject("n2", FaultType::FailNext { count: 2 })
            .unwrap();
        let n2 = nodes()[1].clone();
        assert!(transport.dispatch(Request::new(n2.clone(), "a")).await.is_err());
        assert!(transport.dispatch(Request::new(n2.clone(), "b")).await.is_err());
        assert!(transport.dispatch(Request::new(n2, "c")).await.is_ok());
        assert!(transport.active_faults().is_empty());
        assert_eq!(transport.total_calls(), 3);
    }

    #[tokio::test]
    async fn test_status_fault() {
        let transport = SimulatedTransport::new(&nodes(), 1);
        transport
            .inject("n1", FaultType::Status { code: 404 })
            .unwrap();
        let err = transport
            .dispatch(Request::new(nodes()[0].clone(), "x"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 404);
        assert!(err.is_client_error());
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_spike() {
        let transport = SimulatedTransport::new(&nodes(), 1);
        transport
            .inject("n1", FaultType::LatencySpike { delay_ms: 250 })
            .unwrap();
        let start = tokio::time::Instant::now();
        transport
            .dispatch(Request::new(nodes()[0].clone(), "x"))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(250));
    }
}
