//! # Dependency-Ordered Startup
//!
//! Services declare what they depend on; the coordinator builds a DAG, releases
//! every node whose dependencies are Ready concurrently, and probes it until
//! healthy. A failed node blocks only its own downstream branch.
//!
//! The orchestrator is itself a node (`vaultkeeper`), Ready once the seal is
//! open, and every managed service depends on it.

pub mod coordinator;
pub mod graph;
pub mod manifest;
pub mod probe;

/// Node id of the orchestrator in every manifest-built graph
pub const ORCHESTRATOR_NODE: &str = "vaultkeeper";

pub use coordinator::{
    NodeDefinition, NodeSnapshot, NodeState, RestartRequest, ServiceStatus, StartupCoordinator, StartupReport,
};
pub use graph::DependencyGraph;
pub use manifest::{ServiceManifest, ServiceSpec};
pub use probe::{probe_until_healthy, FnProbe, HealthProbe, HttpProbe, NoProbe, ProbeSpec, TcpProbe};
