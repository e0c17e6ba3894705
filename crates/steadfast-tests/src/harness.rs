//! Test Harness - clusters of simulated service instances and log capture

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex, Once};

use tracing::subscriber::DefaultGuard;
use tracing_subscriber::fmt::MakeWriter;

use steadfast_resilience::context::{CallContext, CLIENT_IP_KEY, PATH_KEY};
use steadfast_resilience::selector::{
    default_node_builder, nodes_from_instances, Node, ServiceInstance,
};
use steadfast_resilience::Result;

static TRACING: Once = Once::new();

/// Installs a global fmt subscriber writing through the test harness.
///
/// Safe to call from every test; only the first call installs it. Honors `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Log lines captured from a thread-local subscriber.
#[derive(Debug, Clone, Default)]
pub struct LogCapture {
    buf: Arc<Mutex<Vec<u8>>>,
}

/// Writer handed out by [`LogCapture`]; appends into the shared buffer.
pub struct CaptureWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl io::Write for CaptureWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.lock().unwrap().extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = CaptureWriter;

    fn make_writer(&'a self) -> Self::Writer {
        CaptureWriter {
            buf: Arc::clone(&self.buf),
        }
    }
}

impl LogCapture {
    /// Captures every event at debug and above on the current thread until the guard drops.
    pub fn install() -> (Self, DefaultGuard) {
        let capture = Self::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(capture.clone())
            .finish();
        let guard = tracing::subscriber::set_default(subscriber);
        (capture, guard)
    }

    /// Everything captured so far.
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().unwrap()).into_owned()
    }

    /// Captured lines that contain `needle`.
    pub fn lines_containing(&self, needle: &str) -> Vec<String> {
        self.contents()
            .lines()
            .filter(|l| l.contains(needle))
            .map(str::to_string)
            .collect()
    }
}

/// Context for a call from `client_ip` to `path`.
pub fn request_context(path: &str, client_ip: &str) -> CallContext {
    CallContext::background()
        .with_value(PATH_KEY, path)
        .with_value(CLIENT_IP_KEY, client_ip)
}

#[derive(Debug, Clone)]
pub struct InstanceConfig {
    pub instance_id: u32,
    pub address: String,
    pub port: u16,
    pub weight: i64,
    pub zone: String,
}

/// A set of service instances as a discovery backend would report them.
#[derive(Debug, Clone)]
pub struct TestCluster {
    service: String,
    instances: Vec<InstanceConfig>,
}

impl TestCluster {
    pub fn single_node() -> Self {
        Self::uniform("echo", 1)
    }

    pub fn three_node() -> Self {
        Self::uniform("echo", 3)
    }

    /// `count` instances of `service` with the default weight, spread over two zones.
    pub fn uniform(service: &str, count: u32) -> Self {
        let instances = (0..count)
            .map(|i| InstanceConfig {
                instance_id: i,
                address: "127.0.0.1".to_string(),
                port: 7000 + i as u16,
                weight: 100,
                zone: if i % 2 == 0 { "a" } else { "b" }.to_string(),
            })
            .collect();
        Self {
            service: service.to_string(),
            instances,
        }
    }

    /// Instances with the given weights, in order.
    pub fn weighted(service: &str, weights: &[i64]) -> Self {
        let mut cluster = Self::uniform(service, weights.len() as u32);
        for (instance, weight) in cluster.instances.iter_mut().zip(weights) {
            instance.weight = *weight;
        }
        cluster
    }

    pub fn node_count(&self) -> usize {
        self.instances.len()
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.instances.iter().map(Self::node_id).collect()
    }

    pub fn addresses(&self) -> Vec<String> {
        self.instances
            .iter()
            .map(|n| format!("{}:{}", n.address, n.port))
            .collect()
    }

    fn node_id(instance: &InstanceConfig) -> String {
        format!("node-{}", instance.instance_id)
    }

    /// Discovery records, one endpoint per instance.
    pub fn instances(&self) -> Vec<ServiceInstance> {
        self.instances
            .iter()
            .map(|n| {
                let mut metadata = HashMap::new();
                metadata.insert("zone".to_string(), n.zone.clone());
                metadata.insert("weight".to_string(), n.weight.to_string());
                ServiceInstance {
                    id: Self::node_id(n),
                    name: self.service.clone(),
                    version: "v1".to_string(),
                    metadata,
                    endpoints: vec![format!("tcp://{}:{}", n.address, n.port)],
                }
            })
            .collect()
    }

    /// Selector nodes built from the discovery records.
    ///
    /// Weights are taken from the `weight` metadata entry.
    pub fn nodes(&self) -> Result<Vec<Node>> {
        let nodes = nodes_from_instances(&self.instances(), &default_node_builder())?;
        Ok(nodes
            .into_iter()
            .map(|node| {
                let weight = node
                    .metadata
                    .get("weight")
                    .and_then(|w| w.parse().ok())
                    .unwrap_or(node.weight);
                node.with_weight(weight)
            })
            .collect())
    }
}
