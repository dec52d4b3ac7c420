//! routelab
//!
//! Builds an emulated network on one Linux host: every node gets its own
//! network namespace, links are veth pairs, switches are bridges, and each
//! router runs a real routing daemon that is supervised for its lifetime.
//! Per-node config, log and PID files live under a base directory so nodes
//! and repeated runs never collide.

// Use mimalloc as the global allocator for tests (non-Windows only)
#[cfg(not(windows))]
#[cfg(test)]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

pub mod builder;
pub mod config;
pub mod context;
pub mod controller;
pub mod daemon;
pub mod error;
pub mod link;
pub mod naming;
pub mod node_state;
pub mod reconcile;
pub mod session;
pub mod status;
pub mod supervisor;
pub mod topology;
pub mod utils;

// Test helpers module - available when test-internals feature is enabled
#[cfg(any(test, feature = "test-internals"))]
pub mod test_helpers;

#[cfg(test)]
pub mod tests;

// Re-export commonly used items
pub use builder::{RunningTopology, TeardownReport, TopologyBuilder, TopologyView};
pub use config::LabConfig;
pub use context::{ContextId, ContextKind, ContextRegistry, ExecEnv};
pub use controller::{ControllerState, TopologyController, WatchMode};
pub use daemon::{DaemonKind, DaemonSpec, ExecSpec};
pub use error::{BuildPhase, Error, Result};
pub use link::{Endpoint, LinkId, LinkRegistry};
pub use node_state::{NodePaths, NodeState};
pub use reconcile::{NodeEvent, RestartPolicy};
pub use session::{ScriptSession, Session, StdinSession};
pub use status::TopologyStatus;
pub use supervisor::{ProcessHandle, ProcessSupervisor, StopOutcome, SupervisorConfig};
pub use topology::{LinkSpec, NodeSpec, Role, Topology};
