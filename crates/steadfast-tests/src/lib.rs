//! Steadfast Test & Validation Infrastructure
//!
//! Utilities for exercising the resilience pipeline end to end: simulated
//! clusters, a fault-injecting in-memory transport, log capture and
//! property-based suites.

pub mod chaos;
pub mod harness;
pub mod proptest_resilience;

mod pipeline_integration;

pub use chaos::{ChaosError, FaultHandle, FaultType, Request, Response, SimulatedTransport};
pub use harness::{init_tracing, request_context, LogCapture, TestCluster};
