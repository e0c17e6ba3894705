//! Client-side node selection.
//!
//! A [`Selector`] holds the current candidate snapshot pushed by discovery,
//! runs the configured filters over it and asks a [`Balancer`] to pick one
//! node per call. Updates replace the whole snapshot with a single pointer
//! swap, so a concurrent `select` observes either the old or the new list.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::context::CallContext;
use crate::error::{ResilienceError, Result};

/// Weight given to nodes built without an explicit weight.
pub const DEFAULT_NODE_WEIGHT: i64 = 100;

/// An addressable service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    /// Unique node identifier.
    pub id: String,
    /// Network address of the node.
    pub address: String,
    /// Free-form labels (zone, version, ...).
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Relative selection preference. Zero or negative is excluded from weighted picks.
    #[serde(default = "default_weight")]
    pub weight: i64,
}

fn default_weight() -> i64 {
    DEFAULT_NODE_WEIGHT
}

impl Node {
    /// Creates a node with the default weight and no metadata.
    pub fn new(id: &str, address: &str) -> Self {
        Node {
            id: id.to_string(),
            address: address.to_string(),
            metadata: HashMap::new(),
            weight: DEFAULT_NODE_WEIGHT,
        }
    }

    /// Sets the weight.
    pub fn with_weight(mut self, weight: i64) -> Self {
        self.weight = weight;
        self
    }

    /// Adds one metadata entry.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }
}

/// A registered service instance as reported by discovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstance {
    /// Instance identifier.
    pub id: String,
    /// Service name.
    pub name: String,
    /// Service version.
    pub version: String,
    /// Instance labels.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Reachable endpoints; each one becomes a node.
    #[serde(default)]
    pub endpoints: Vec<String>,
}

/// Builds a node from `(id, address, metadata)`.
pub type NodeBuilder = Arc<dyn Fn(&str, &str, &HashMap<String, String>) -> Result<Node> + Send + Sync>;

/// The default builder: copies the fields and assigns [`DEFAULT_NODE_WEIGHT`].
pub fn default_node_builder() -> NodeBuilder {
    Arc::new(|id: &str, address: &str, metadata: &HashMap<String, String>| {
        Ok(Node {
            id: id.to_string(),
            address: address.to_string(),
            metadata: metadata.clone(),
            weight: DEFAULT_NODE_WEIGHT,
        })
    })
}

/// Expands every endpoint of every instance into a node.
///
/// Fails on the first builder error.
pub fn nodes_from_instances(instances: &[ServiceInstance], builder: &NodeBuilder) -> Result<Vec<Node>> {
    let mut nodes = Vec::with_capacity(instances.iter().map(|i| i.endpoints.len()).sum());
    for instance in instances {
        for endpoint in &instance.endpoints {
            nodes.push(builder(&instance.id, endpoint, &instance.metadata)?);
        }
    }
    Ok(nodes)
}

/// Maps a candidate list to a (possibly smaller) candidate list.
pub type Filter = Arc<dyn Fn(&[Node]) -> Vec<Node> + Send + Sync>;

/// Adapts a closure into a [`Filter`].
pub fn filter_fn<F>(f: F) -> Filter
where
    F: Fn(&[Node]) -> Vec<Node> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// A load-balancing strategy.
pub trait Balancer: Send + Sync {
    /// Picks one node from a non-empty list.
    fn pick(&self, ctx: &CallContext, nodes: &[Node]) -> Result<Node>;
}

fn next_random(rng: &Mutex<StdRng>, n: u64) -> u64 {
    if n == 0 {
        return 0;
    }
    rng.lock().unwrap_or_else(|e| e.into_inner()).gen_range(0..n)
}

/// Uniform random pick.
pub struct Random {
    rng: Mutex<StdRng>,
}

impl Random {
    /// Creates a balancer seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Creates a balancer with a reproducible sequence.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for Random {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for Random {
    fn pick(&self, _ctx: &CallContext, nodes: &[Node]) -> Result<Node> {
        if nodes.is_empty() {
            return Err(ResilienceError::NoAvailableNode);
        }
        let idx = next_random(&self.rng, nodes.len() as u64) as usize;
        Ok(nodes[idx].clone())
    }
}

/// Round-robin pick over a shared, never-reset counter.
///
/// The counter survives snapshot updates, so right after the node set grows or
/// shrinks the rotation can skew for a lap.
#[derive(Debug, Default)]
pub struct RoundRobin {
    counter: AtomicU64,
}

impl RoundRobin {
    /// Creates a balancer with the counter at zero.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Balancer for RoundRobin {
    fn pick(&self, _ctx: &CallContext, nodes: &[Node]) -> Result<Node> {
        if nodes.is_empty() {
            return Err(ResilienceError::NoAvailableNode);
        }
        let count = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        Ok(nodes[(count % nodes.len() as u64) as usize].clone())
    }
}

/// Weighted random pick over positive weights, uniform when no weight is positive.
pub struct WeightedRandom {
    rng: Mutex<StdRng>,
}

impl WeightedRandom {
    /// Creates a balancer seeded from OS entropy.
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Creates a balancer with a reproducible sequence.
    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for WeightedRandom {
    fn default() -> Self {
        Self::new()
    }
}

impl Balancer for WeightedRandom {
    fn pick(&self, _ctx: &CallContext, nodes: &[Node]) -> Result<Node> {
        if nodes.is_empty() {
            return Err(ResilienceError::NoAvailableNode);
        }

        let total: u64 = nodes
            .iter()
            .filter(|n| n.weight > 0)
            .fold(0u64, |acc, n| acc.saturating_add(n.weight as u64));

        if total == 0 {
            let idx = next_random(&self.rng, nodes.len() as u64) as usize;
            return Ok(nodes[idx].clone());
        }

        let mut offset = next_random(&self.rng, total) as i128;
        let mut last_positive = None;
        for node in nodes.iter().filter(|n| n.weight > 0) {
            offset -= node.weight as i128;
            if offset < 0 {
                return Ok(node.clone());
            }
            last_positive = Some(node);
        }

        // Only reachable if the weight sum saturated.
        last_positive
            .cloned()
            .ok_or(ResilienceError::NoAvailableNode)
    }
}

/// Built-in balancing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    /// [`Random`]
    #[default]
    Random,
    /// [`RoundRobin`]
    RoundRobin,
    /// [`WeightedRandom`]
    WeightedRandom,
}

impl BalancerKind {
    /// Instantiates the strategy.
    pub fn build(self) -> Arc<dyn Balancer> {
        match self {
            BalancerKind::Random => Arc::new(Random::new()),
            BalancerKind::RoundRobin => Arc::new(RoundRobin::new()),
            BalancerKind::WeightedRandom => Arc::new(WeightedRandom::new()),
        }
    }
}

/// Construction-time selector settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectorConfig {
    /// Balancing strategy.
    #[serde(default)]
    pub balancer: BalancerKind,
}

/// Picks one node per call from the latest discovery snapshot.
pub struct Selector {
    nodes: RwLock<Arc<Vec<Node>>>,
    filters: RwLock<Vec<Filter>>,
    balancer: Arc<dyn Balancer>,
}

impl Selector {
    /// Creates an empty selector using `balancer`.
    pub fn new(balancer: Arc<dyn Balancer>) -> Self {
        Self {
            nodes: RwLock::new(Arc::new(Vec::new())),
            filters: RwLock::new(Vec::new()),
            balancer,
        }
    }

    /// Creates an empty selector from configuration.
    pub fn from_config(config: &SelectorConfig) -> Self {
        Self::new(config.balancer.build())
    }

    /// Adds filters at construction time.
    pub fn with_filters(self, filters: Vec<Filter>) -> Self {
        self.apply(filters);
        self
    }

    /// Picks a node for the next call.
    ///
    /// Returns [`ResilienceError::NoAvailableNode`] if the snapshot is empty or
    /// any filter step leaves nothing; the balancer is not consulted then.
    pub fn select(&self, ctx: &CallContext) -> Result<Node> {
        let snapshot = self.nodes();
        if snapshot.is_empty() {
            debug!(path = ctx.path(), "no nodes to select from");
            return Err(ResilienceError::NoAvailableNode);
        }

        let filters = self
            .filters
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut filtered: Option<Vec<Node>> = None;
        for (step, filter) in filters.iter().enumerate() {
            let next = filter(filtered.as_deref().unwrap_or(snapshot.as_slice()));
            if next.is_empty() {
                debug!(path = ctx.path(), step, "filters removed every node");
                return Err(ResilienceError::NoAvailableNode);
            }
            filtered = Some(next);
        }

        self.balancer
            .pick(ctx, filtered.as_deref().unwrap_or(snapshot.as_slice()))
    }

    /// Replaces the candidate set (last writer wins).
    pub fn update(&self, nodes: Vec<Node>) {
        let new_len = nodes.len();
        let old = {
            let mut guard = self.nodes.write().unwrap_or_else(|e| e.into_inner());
            std::mem::replace(&mut *guard, Arc::new(nodes))
        };
        debug!(old = old.len(), new = new_len, "selector nodes updated");
    }

    /// Appends filters, applied in order after the existing ones.
    pub fn apply(&self, filters: impl IntoIterator<Item = Filter>) {
        self.filters
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .extend(filters);
    }

    /// The current snapshot.
    pub fn nodes(&self) -> Arc<Vec<Node>> {
        Arc::clone(&self.nodes.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Number of nodes in the current snapshot.
    pub fn len(&self) -> usize {
        self.nodes().len()
    }

    /// True if the snapshot is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Selector {
    fn default() -> Self {
        Self::new(Arc::new(Random::new()))
    }
}
