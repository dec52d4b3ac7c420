//! Routing daemon invocation templates.
//!
//! A [`DaemonSpec`] describes how to start one kind of routing daemon; it is
//! rendered per node into an [`ExecSpec`] with that node's paths substituted.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::node_state::NodePaths;

/// Daemon family; fixes the management console port.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum DaemonKind {
    Zebra,
    Ripd,
    Ospfd,
    #[default]
    Bgpd,
    /// Any other daemon; the console port is configured on the `DaemonSpec`.
    Custom,
}

impl DaemonKind {
    /// Fixed console (vty) port for the daemon type.
    pub const fn console_port(self) -> Option<u16> {
        match self {
            DaemonKind::Zebra => Some(2601),
            DaemonKind::Ripd => Some(2602),
            DaemonKind::Ospfd => Some(2604),
            DaemonKind::Bgpd => Some(2605),
            DaemonKind::Custom => None,
        }
    }

    /// Protocol ports the daemon listens on besides its console.
    pub fn protocol_ports(self) -> Vec<u16> {
        match self {
            DaemonKind::Ripd => vec![520],
            DaemonKind::Bgpd => vec![179],
            DaemonKind::Zebra | DaemonKind::Ospfd | DaemonKind::Custom => Vec::new(),
        }
    }

    pub const fn binary(self) -> &'static str {
        match self {
            DaemonKind::Zebra => "zebra",
            DaemonKind::Ripd => "ripd",
            DaemonKind::Ospfd => "ospfd",
            DaemonKind::Bgpd => "bgpd",
            DaemonKind::Custom => "",
        }
    }
}

impl fmt::Display for DaemonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonKind::Custom => write!(f, "custom"),
            other => write!(f, "{}", other.binary()),
        }
    }
}

impl std::str::FromStr for DaemonKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "zebra" => Ok(DaemonKind::Zebra),
            "ripd" => Ok(DaemonKind::Ripd),
            "ospfd" => Ok(DaemonKind::Ospfd),
            "bgpd" => Ok(DaemonKind::Bgpd),
            "custom" => Ok(DaemonKind::Custom),
            _ => Err(format!(
                "invalid daemon '{s}': use zebra, ripd, ospfd, bgpd, or custom"
            )),
        }
    }
}

impl clap::ValueEnum for DaemonKind {
    fn value_variants<'a>() -> &'a [Self] {
        &[
            DaemonKind::Zebra,
            DaemonKind::Ripd,
            DaemonKind::Ospfd,
            DaemonKind::Bgpd,
            DaemonKind::Custom,
        ]
    }

    fn to_possible_value(&self) -> Option<clap::builder::PossibleValue> {
        Some(clap::builder::PossibleValue::new(match self {
            DaemonKind::Zebra => "zebra",
            DaemonKind::Ripd => "ripd",
            DaemonKind::Ospfd => "ospfd",
            DaemonKind::Bgpd => "bgpd",
            DaemonKind::Custom => "custom",
        }))
    }
}

/// How to start a daemon, with `{placeholders}` in `args`.
///
/// Placeholders: `{node}`, `{config_dir}`, `{log_path}`, `{pid_path}`,
/// `{run_dir}`, `{console_port}`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DaemonSpec {
    pub kind: DaemonKind,
    pub binary: String,
    pub args: Vec<String>,
    pub console_port: u16,
    pub env: BTreeMap<String, String>,
}

impl Default for DaemonSpec {
    fn default() -> Self {
        Self::quagga(DaemonKind::Bgpd)
    }
}

impl DaemonSpec {
    /// Quagga-style daemon reading `<config_dir>/<daemon>.conf`, with its vty
    /// bound to localhost and a zebra socket private to the node.
    ///
    /// Runs in the foreground so the supervisor owns the process. The daemon
    /// keeps its own pid file next to, not on top of, the supervisor's.
    pub fn quagga(kind: DaemonKind) -> Self {
        let conf = format!("{{config_dir}}/{}.conf", kind.binary());
        let own_pid = format!("{{run_dir}}/{{node}}.{}.pidfile", kind.binary());
        let args = [
            "-f",
            conf.as_str(),
            "-i",
            own_pid.as_str(),
            "-z",
            "{run_dir}/{node}.zserv.api",
            "-A",
            "127.0.0.1",
            "-P",
            "{console_port}",
        ];
        Self {
            kind,
            binary: kind.binary().to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
            console_port: kind.console_port().unwrap_or_default(),
            env: BTreeMap::new(),
        }
    }

    /// Arbitrary binary with a caller-chosen console port.
    pub fn custom(binary: impl Into<String>, args: Vec<String>, console_port: u16) -> Self {
        Self {
            kind: DaemonKind::Custom,
            binary: binary.into(),
            args,
            console_port,
            env: BTreeMap::new(),
        }
    }

    /// Substitute one node's paths into the template.
    pub fn render(&self, node: &str, paths: &NodePaths, credential: Option<&str>) -> ExecSpec {
        let run_dir = paths
            .pid_path
            .parent()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let vars = [
            ("{node}", node.to_string()),
            ("{config_dir}", paths.config_dir.display().to_string()),
            ("{log_path}", paths.log_path.display().to_string()),
            ("{pid_path}", paths.pid_path.display().to_string()),
            ("{run_dir}", run_dir),
            ("{console_port}", self.console_port.to_string()),
        ];
        let args = self
            .args
            .iter()
            .map(|arg| {
                vars.iter()
                    .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect();

        ExecSpec {
            binary: PathBuf::from(&self.binary),
            args,
            config_dir: paths.config_dir.clone(),
            log_path: paths.log_path.clone(),
            pid_path: paths.pid_path.clone(),
            listen_ports: self.kind.protocol_ports(),
            console: ConsoleSpec {
                port: self.console_port,
                credential: credential.map(str::to_string),
            },
            env: self.env.clone(),
        }
    }
}

/// Fully rendered invocation of one daemon for one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecSpec {
    pub binary: PathBuf,
    pub args: Vec<String>,
    pub config_dir: PathBuf,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
    pub listen_ports: Vec<u16>,
    pub console: ConsoleSpec,
    pub env: BTreeMap<String, String>,
}

/// Management console binding. The credential is passed through untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleSpec {
    pub port: u16,
    pub credential: Option<String>,
}
