//! Host network plumbing for namespace-based topology emulation.
//!
//! Uses Linux network namespaces, veth pairs, bridges and `tc netem` through
//! iproute2, behind the [`NetBackend`] trait so callers can substitute an
//! in-memory implementation in tests.
//!
//! # Modules
//!
//! - [`backend`]: the [`NetBackend`] trait and its iproute2 implementation
//! - [`command`]: privileged command execution (`root` or `sudo`)
//! - [`impairment`]: `tc netem` link shaping
//! - [`host`]: host readiness checks and scratch namespace prefixes

pub mod backend;
pub mod command;
pub mod host;
pub mod impairment;

pub use backend::{IpBackend, NETNS_RUN_DIR, NetBackend};
pub use command::{CommandFailed, Privilege, check_binary};
pub use host::{HostCheck, check_privileges, scratch_prefix};
pub use impairment::Shaping;
