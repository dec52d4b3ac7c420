//! Error types for topology emulation.

use std::fmt;
use std::path::PathBuf;

use netkit::CommandFailed;

/// Result type alias for emulator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Build stage an error surfaced from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildPhase {
    Validate,
    Preflight,
    Contexts,
    Links,
    Launch,
}

impl fmt::Display for BuildPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildPhase::Validate => write!(f, "validate"),
            BuildPhase::Preflight => write!(f, "preflight"),
            BuildPhase::Contexts => write!(f, "contexts"),
            BuildPhase::Links => write!(f, "links"),
            BuildPhase::Launch => write!(f, "launch"),
        }
    }
}

/// Errors that can occur while building, running or tearing down a topology.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Validation
    // =========================================================================
    /// Malformed topology, detected before any allocation.
    #[error("invalid topology: {0}")]
    TopologyInvalid(String),

    /// A router's startup configuration directory is absent or unreadable.
    #[error("config directory for '{node}' missing or unreadable: {}", .path.display())]
    ConfigMissing { node: String, path: PathBuf },

    // =========================================================================
    // Allocation
    // =========================================================================
    /// The host refused to allocate a namespace or interface.
    #[error("host resources exhausted while allocating {what}: {reason}")]
    ResourceExhausted { what: String, reason: String },

    /// Interface already belongs to another context.
    #[error("interface '{iface}' is already attached to context of '{owner}'")]
    AlreadyAttached { iface: String, owner: String },

    /// Endpoint already carries a link.
    #[error("endpoint {endpoint} is already linked")]
    EndpointBusy { endpoint: String },

    /// Host-level name already in use by another live topology.
    #[error("name '{name}' is already in use on this host{}", .owner.as_ref().map(|o| format!(" (owner {o})")).unwrap_or_default())]
    NameCollision { name: String, owner: Option<String> },

    // =========================================================================
    // Process supervision
    // =========================================================================
    /// Daemon binary missing or launch preconditions unmet.
    #[error("failed to launch daemon for '{node}': {reason}")]
    LaunchFailed { node: String, reason: String },

    /// A live daemon already owns the node's PID file.
    #[error("daemon for '{node}' already running (pid {pid})")]
    AlreadyRunning { node: String, pid: u32 },

    /// Graceful stop exceeded the grace period; the process was killed.
    #[error("daemon for '{node}' (pid {pid}) ignored SIGTERM; killed")]
    StopTimeout { node: String, pid: u32 },

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// Operating on an already-destroyed or disconnected entity.
    #[error("not found: {0}")]
    NotFound(String),

    /// Controller operation not valid in the current state.
    #[error("operation '{op}' not allowed while {state}")]
    InvalidState { op: &'static str, state: String },

    /// Build failed; everything allocated so far has been torn down.
    #[error("build failed during {phase}{}: {source}", .node.as_ref().map(|n| format!(" at node '{n}'")).unwrap_or_default())]
    Build {
        phase: BuildPhase,
        node: Option<String>,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Host / IO
    // =========================================================================
    /// Any other host command failure.
    #[error("{op}: {reason}")]
    Host { op: String, reason: String },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    /// `false` for conditions that are reported but do not fail an operation.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::StopTimeout { .. })
    }

    /// Innermost error, looking through [`Error::Build`].
    pub fn root(&self) -> &Error {
        match self {
            Error::Build { source, .. } => source.root(),
            other => other,
        }
    }

    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn build(phase: BuildPhase, node: Option<&str>, source: Error) -> Self {
        // Don't nest build contexts.
        if let Error::Build { .. } = source {
            return source;
        }
        Error::Build {
            phase,
            node: node.map(str::to_string),
            source: Box::new(source),
        }
    }

    /// Classify a failed host operation by the stderr it produced.
    pub(crate) fn from_host(what: &str, name: &str, err: anyhow::Error) -> Self {
        let stderr = err
            .chain()
            .find_map(|e| e.downcast_ref::<CommandFailed>())
            .map(|f| f.stderr.clone())
            .unwrap_or_default();

        if stderr.contains("File exists") {
            return Error::NameCollision {
                name: name.to_string(),
                owner: None,
            };
        }
        if ["No space left", "Cannot allocate memory", "Too many open files", "No buffer space"]
            .iter()
            .any(|needle| stderr.contains(needle))
        {
            return Error::ResourceExhausted {
                what: format!("{what} '{name}'"),
                reason: stderr,
            };
        }

        Error::Host {
            op: format!("{what} '{name}'"),
            reason: format!("{err:#}"),
        }
    }
}
