#![cfg(any(test, feature = "test-internals"))]
#![allow(dead_code)] // Allow unused helpers - they're used by library tests but not binary tests

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use netkit::{CommandFailed, NetBackend, Privilege, Shaping};

use crate::config::LabConfig;
use crate::daemon::DaemonSpec;
use crate::reconcile::RestartPolicy;
use crate::supervisor::SupervisorConfig;

/// `None` is the host namespace.
type Netns = Option<String>;

#[derive(Debug, Default)]
struct State {
    namespaces: BTreeSet<String>,
    /// (netns, iface) -> peer (netns, iface). Both directions are stored.
    veths: BTreeMap<(Netns, String), (Netns, String)>,
    bridges: BTreeSet<(String, String)>,
    masters: BTreeMap<(String, String), String>,
    addrs: BTreeMap<(String, String), Vec<String>>,
    shaped: BTreeMap<(String, String), Shaping>,
    ops: Vec<String>,
    failures: Vec<Failure>,
}

#[derive(Debug, Clone)]
struct Failure {
    op: &'static str,
    pattern: String,
    stderr: String,
}

/// In-memory [`NetBackend`] that models namespaces and veth pairs closely
/// enough to check wiring, unwinding and leaks without privileges.
///
/// Commands "run inside" a namespace are plain host processes.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    state: Arc<Mutex<State>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail the next calls of `op` whose target contains `pattern`, with a
    /// host command error carrying `stderr`.
    pub fn fail_on(&self, op: &'static str, pattern: &str, stderr: &str) {
        self.lock().failures.push(Failure {
            op,
            pattern: pattern.to_string(),
            stderr: stderr.to_string(),
        });
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    /// Pretend some other process created `name`.
    pub fn insert_foreign_netns(&self, name: &str) {
        self.lock().namespaces.insert(name.to_string());
    }

    pub fn namespaces(&self) -> Vec<String> {
        self.lock().namespaces.iter().cloned().collect()
    }

    pub fn namespace_count(&self) -> usize {
        self.lock().namespaces.len()
    }

    /// veth ends anywhere, host namespace included.
    pub fn veth_end_count(&self) -> usize {
        self.lock().veths.len()
    }

    /// Interfaces inside `netns`, `lo` excluded.
    pub fn interfaces_in(&self, netns: &str) -> Vec<String> {
        self.lock()
            .veths
            .keys()
            .filter(|(ns, _)| ns.as_deref() == Some(netns))
            .map(|(_, iface)| iface.clone())
            .collect()
    }

    /// `(netns, iface)` at the far end of the veth `(netns, iface)`.
    pub fn peer_of(&self, netns: &str, iface: &str) -> Option<(Option<String>, String)> {
        self.lock()
            .veths
            .get(&(Some(netns.to_string()), iface.to_string()))
            .cloned()
    }

    pub fn master_of(&self, netns: &str, iface: &str) -> Option<String> {
        self.lock()
            .masters
            .get(&(netns.to_string(), iface.to_string()))
            .cloned()
    }

    pub fn addrs_of(&self, netns: &str, iface: &str) -> Vec<String> {
        self.lock()
            .addrs
            .get(&(netns.to_string(), iface.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn shaping_of(&self, netns: &str, iface: &str) -> Option<Shaping> {
        self.lock()
            .shaped
            .get(&(netns.to_string(), iface.to_string()))
            .cloned()
    }

    pub fn has_bridge(&self, netns: &str, bridge: &str) -> bool {
        self.lock()
            .bridges
            .contains(&(netns.to_string(), bridge.to_string()))
    }

    /// Every host operation performed, in order.
    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn op_count(&self) -> usize {
        self.lock().ops.len()
    }

    /// Record `op target` and apply any matching injected failure.
    fn enter(&self, state: &mut State, op: &'static str, target: &str) -> Result<()> {
        state.ops.push(format!("{op} {target}"));
        if let Some(f) = state
            .failures
            .iter()
            .find(|f| f.op == op && target.contains(&f.pattern))
        {
            return Err(CommandFailed {
                command: format!("{op} {target}"),
                stderr: f.stderr.clone(),
            }
            .into());
        }
        Ok(())
    }

    fn require_netns(state: &State, netns: &str) -> Result<()> {
        if !state.namespaces.contains(netns) {
            return Err(CommandFailed {
                command: format!("ip -n {netns}"),
                stderr: format!("Cannot open network namespace \"{netns}\": No such file or directory"),
            }
            .into());
        }
        Ok(())
    }

    fn key(netns: Option<&str>, iface: &str) -> (Netns, String) {
        (netns.map(str::to_string), iface.to_string())
    }

    /// Remove a veth end and its peer, plus anything hanging off either.
    fn drop_pair(state: &mut State, end: &(Netns, String)) {
        if let Some(peer) = state.veths.remove(end) {
            state.veths.remove(&peer);
            for (ns, iface) in [end, &peer] {
                if let Some(ns) = ns {
                    let k = (ns.clone(), iface.clone());
                    state.masters.remove(&k);
                    state.addrs.remove(&k);
                    state.shaped.remove(&k);
                }
            }
        }
    }

    fn relocate(state: &mut State, from: &(Netns, String), to: (Netns, String)) -> Result<()> {
        if state.veths.contains_key(&to) {
            bail!(CommandFailed {
                command: format!("ip link set {}", from.1),
                stderr: "RTNETLINK answers: File exists".into(),
            });
        }
        let peer = state
            .veths
            .remove(from)
            .ok_or_else(|| anyhow!("Cannot find device \"{}\"", from.1))?;
        state.veths.insert(peer.clone(), to.clone());
        state.veths.insert(to, peer);
        Ok(())
    }
}

impl NetBackend for MemoryBackend {
    fn netns_add(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "netns_add", name)?;
        if !state.namespaces.insert(name.to_string()) {
            bail!(CommandFailed {
                command: format!("ip netns add {name}"),
                stderr: format!("Cannot create namespace file \"/var/run/netns/{name}\": File exists"),
            });
        }
        Ok(())
    }

    fn netns_del(&self, name: &str) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "netns_del", name)?;
        Self::require_netns(&state, name)?;
        state.namespaces.remove(name);
        let inside: Vec<_> = state
            .veths
            .keys()
            .filter(|(ns, _)| ns.as_deref() == Some(name))
            .cloned()
            .collect();
        for end in inside {
            Self::drop_pair(&mut state, &end);
        }
        state.bridges.retain(|(ns, _)| ns != name);
        Ok(())
    }

    fn netns_list(&self) -> Result<Vec<String>> {
        Ok(self.namespaces())
    }

    fn veth_add(&self, a: &str, b: &str) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "veth_add", &format!("{a} {b}"))?;
        let (ka, kb) = (Self::key(None, a), Self::key(None, b));
        if state.veths.contains_key(&ka) || state.veths.contains_key(&kb) {
            bail!(CommandFailed {
                command: format!("ip link add {a} type veth peer name {b}"),
                stderr: "RTNETLINK answers: File exists".into(),
            });
        }
        state.veths.insert(ka.clone(), kb.clone());
        state.veths.insert(kb, ka);
        Ok(())
    }

    fn link_move(&self, iface: &str, netns: &str, new_name: &str) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "link_move", &format!("{iface} {netns} {new_name}"))?;
        Self::require_netns(&state, netns)?;
        Self::relocate(&mut state, &Self::key(None, iface), Self::key(Some(netns), new_name))
    }

    fn link_rename(&self, netns: Option<&str>, iface: &str, new_name: &str) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "link_rename", &format!("{iface} {new_name}"))?;
        if iface == new_name {
            return Ok(());
        }
        Self::relocate(&mut state, &Self::key(netns, iface), Self::key(netns, new_name))
    }

    fn link_del(&self, netns: Option<&str>, iface: &str) -> Result<()> {
        let mut state = self.lock();
        let target = format!("{}/{iface}", netns.unwrap_or("host"));
        self.enter(&mut state, "link_del", &target)?;
        if let Some(ns) = netns {
            Self::require_netns(&state, ns)?;
        }
        let key = Self::key(netns, iface);
        if !state.veths.contains_key(&key) {
            bail!(CommandFailed {
                command: format!("ip link del {iface}"),
                stderr: format!("Cannot find device \"{iface}\""),
            });
        }
        Self::drop_pair(&mut state, &key);
        Ok(())
    }

    fn link_exists(&self, netns: Option<&str>, iface: &str) -> Result<bool> {
        let state = self.lock();
        if let Some(ns) = netns
            && !state.namespaces.contains(ns)
        {
            return Ok(false);
        }
        Ok(state.veths.contains_key(&Self::key(netns, iface)))
    }

    fn bridge_add(&self, netns: &str, bridge: &str) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "bridge_add", netns)?;
        Self::require_netns(&state, netns)?;
        state.bridges.insert((netns.to_string(), bridge.to_string()));
        Ok(())
    }

    fn bridge_attach(&self, netns: &str, bridge: &str, iface: &str) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "bridge_attach", &format!("{netns}/{iface}"))?;
        if !state.bridges.contains(&(netns.to_string(), bridge.to_string())) {
            bail!("no bridge {bridge} in {netns}");
        }
        state
            .masters
            .insert((netns.to_string(), iface.to_string()), bridge.to_string());
        Ok(())
    }

    fn addr_add(&self, netns: &str, iface: &str, cidr: &str) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "addr_add", &format!("{netns}/{iface} {cidr}"))?;
        Self::require_netns(&state, netns)?;
        state
            .addrs
            .entry((netns.to_string(), iface.to_string()))
            .or_default()
            .push(cidr.to_string());
        Ok(())
    }

    fn shape(&self, netns: &str, iface: &str, shaping: &Shaping) -> Result<()> {
        let mut state = self.lock();
        self.enter(&mut state, "shape", &format!("{netns}/{iface}"))?;
        state
            .shaped
            .insert((netns.to_string(), iface.to_string()), shaping.clone());
        Ok(())
    }

    fn command_in(&self, _netns: &str, program: &str) -> Command {
        Command::new(program)
    }
}

/// Shell loop that ignores SIGTERM, for exercising the kill path.
pub const STUBBORN_DAEMON: &str = "trap '' TERM; while :; do sleep 0.1; done";

/// Lab config rooted at `base` with timeouts short enough for tests, running
/// `sleep` as the daemon.
pub fn test_config(base: &Path) -> LabConfig {
    LabConfig {
        base_dir: base.to_path_buf(),
        prefix: "rlt-".to_string(),
        daemon: DaemonSpec::custom("sleep", vec!["30".into()], 2605),
        dir_mode: 0o755,
        daemon_owner: None,
        supervisor: SupervisorConfig {
            startup_probe: Duration::from_millis(100),
            launch_timeout: Duration::from_secs(2),
            grace_period: Duration::from_millis(500),
            kill_timeout: Duration::from_secs(2),
            wait_for_console: false,
            privilege: Privilege::Root,
        },
        reconcile_interval: Duration::from_millis(50),
        restart: RestartPolicy::Never,
        build_parallelism: 4,
    }
}

/// Daemon spec running `script` through `sh -c`.
pub fn shell_daemon(script: &str) -> DaemonSpec {
    DaemonSpec::custom("sh", vec!["-c".into(), script.into()], 2605)
}

/// Create `<base>/conf/<node>/` with a stub config file.
pub fn write_router_config(base: &Path, node: &str) -> PathBuf {
    let dir = base.join("conf").join(node);
    fs::create_dir_all(&dir).unwrap();
    fs::write(dir.join("bgpd.conf"), format!("hostname {node}\n")).unwrap();
    dir
}

/// PID of a process that has already exited and been reaped.
pub fn dead_pid() -> u32 {
    let mut child = Command::new("true").spawn().unwrap();
    let pid = child.id();
    child.wait().unwrap();
    pid
}

/// Files in `dir` with extension `ext`.
pub fn files_with_ext(dir: &Path, ext: &str) -> Vec<PathBuf> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut files: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|e| e == ext))
        .collect();
    files.sort();
    files
}
