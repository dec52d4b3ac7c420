//! Lab configuration.
//!
//! [`LabConfig`] carries every tunable of a build. The binary fills it from
//! [`LabArgs`]; library users start from `LabConfig::default()`.

use std::path::PathBuf;
use std::time::Duration;

use clap::Args;

use crate::daemon::{DaemonKind, DaemonSpec};
use crate::reconcile::{DEFAULT_RESTART_BASE_DELAY, RestartPolicy};
use crate::supervisor::{
    DEFAULT_GRACE_PERIOD, DEFAULT_KILL_TIMEOUT, DEFAULT_LAUNCH_TIMEOUT, DEFAULT_STARTUP_PROBE,
    SupervisorConfig,
};

pub const DEFAULT_BASE_DIR: &str = "/tmp/routelab";
pub const DEFAULT_PREFIX: &str = "rl-";
/// World-writable with the sticky bit, so an unprivileged daemon can create
/// its own files next to everyone else's.
pub const DEFAULT_DIR_MODE: u32 = 0o1777;
pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_BUILD_PARALLELISM: usize = 8;

#[derive(Clone, Debug)]
pub struct LabConfig {
    /// Root of `conf/`, `log/` and `run/`.
    pub base_dir: PathBuf,
    /// Prepended to node names to form namespace names.
    pub prefix: String,
    pub daemon: DaemonSpec,
    pub dir_mode: u32,
    /// uid/gid given to created state directories.
    pub daemon_owner: Option<(u32, u32)>,
    pub supervisor: SupervisorConfig,
    pub reconcile_interval: Duration,
    pub restart: RestartPolicy,
    /// Contexts created concurrently during a build.
    pub build_parallelism: usize,
}

impl Default for LabConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from(DEFAULT_BASE_DIR),
            prefix: DEFAULT_PREFIX.to_string(),
            daemon: DaemonSpec::default(),
            dir_mode: DEFAULT_DIR_MODE,
            daemon_owner: None,
            supervisor: SupervisorConfig::default(),
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            restart: RestartPolicy::Never,
            build_parallelism: DEFAULT_BUILD_PARALLELISM,
        }
    }
}

/// Command-line flags shared by every subcommand.
#[derive(Args, Debug, Clone)]
pub struct LabArgs {
    /// Directory holding per-node conf/, log/ and run/
    #[arg(long = "base-dir", default_value = DEFAULT_BASE_DIR)]
    pub base_dir: PathBuf,

    /// Namespace name prefix
    #[arg(long = "prefix", default_value = DEFAULT_PREFIX)]
    pub prefix: String,

    /// Routing daemon run on every router
    #[arg(long = "daemon", value_enum, default_value = "bgpd")]
    pub daemon: DaemonKind,

    /// Daemon binary (defaults to the daemon name, looked up in PATH)
    #[arg(long = "daemon-binary")]
    pub daemon_binary: Option<PathBuf>,

    /// Console port for a custom daemon
    #[arg(long = "console-port", default_value = "2605")]
    pub console_port: u16,

    /// Owner of created state directories, as UID:GID
    #[arg(long = "owner", value_parser = parse_owner)]
    pub owner: Option<(u32, u32)>,

    /// Wait for each daemon's console port before continuing
    #[arg(long = "wait-console")]
    pub wait_console: bool,

    /// Time a daemon must survive after start, in ms
    #[arg(long = "startup-probe-ms", default_value_t = DEFAULT_STARTUP_PROBE.as_millis() as u64)]
    pub startup_probe_ms: u64,

    /// Upper bound on waiting for a daemon console, in ms
    #[arg(long = "launch-timeout-ms", default_value_t = DEFAULT_LAUNCH_TIMEOUT.as_millis() as u64)]
    pub launch_timeout_ms: u64,

    /// Time between SIGTERM and SIGKILL, in ms
    #[arg(long = "grace-ms", default_value_t = DEFAULT_GRACE_PERIOD.as_millis() as u64)]
    pub grace_ms: u64,

    /// Time allowed for a killed daemon to exit, in ms
    #[arg(long = "kill-timeout-ms", default_value_t = DEFAULT_KILL_TIMEOUT.as_millis() as u64)]
    pub kill_timeout_ms: u64,

    /// Restart exited daemons up to N times (0 disables restarts)
    #[arg(long = "restart", default_value = "0")]
    pub restart: u32,

    /// Liveness check interval, in ms
    #[arg(long = "reconcile-ms", default_value_t = DEFAULT_RECONCILE_INTERVAL.as_millis() as u64)]
    pub reconcile_ms: u64,

    /// Namespaces created concurrently
    #[arg(long = "parallelism", default_value_t = DEFAULT_BUILD_PARALLELISM)]
    pub parallelism: usize,
}

impl LabConfig {
    /// Create config from CLI arguments.
    pub fn from_cli(args: &LabArgs) -> Self {
        let mut daemon = match args.daemon {
            DaemonKind::Custom => DaemonSpec::custom("", Vec::new(), args.console_port),
            kind => DaemonSpec::quagga(kind),
        };
        if let Some(binary) = &args.daemon_binary {
            daemon.binary = binary.display().to_string();
        }

        let restart = match args.restart {
            0 => RestartPolicy::Never,
            n => RestartPolicy::OnFailure {
                max_restarts: n,
                base_delay: DEFAULT_RESTART_BASE_DELAY,
            },
        };

        Self {
            base_dir: args.base_dir.clone(),
            prefix: args.prefix.clone(),
            daemon,
            dir_mode: DEFAULT_DIR_MODE,
            daemon_owner: args.owner,
            supervisor: SupervisorConfig {
                startup_probe: Duration::from_millis(args.startup_probe_ms),
                launch_timeout: Duration::from_millis(args.launch_timeout_ms),
                grace_period: Duration::from_millis(args.grace_ms),
                kill_timeout: Duration::from_millis(args.kill_timeout_ms),
                wait_for_console: args.wait_console,
                ..SupervisorConfig::default()
            },
            reconcile_interval: Duration::from_millis(args.reconcile_ms.max(10)),
            restart,
            build_parallelism: args.parallelism.max(1),
        }
    }
}

fn parse_owner(s: &str) -> Result<(u32, u32), String> {
    let (uid, gid) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid owner '{s}': expected UID:GID"))?;
    let uid = uid.parse().map_err(|_| format!("invalid uid '{uid}'"))?;
    let gid = gid.parse().map_err(|_| format!("invalid gid '{gid}'"))?;
    Ok((uid, gid))
}
