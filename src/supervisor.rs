//! Routing daemon lifecycle inside a node's context.
//!
//! The supervisor starts a daemon as a child process in its node's namespace,
//! records its PID, probes that it survives startup and stops it with a
//! TERM / grace / KILL sequence against its process group.

use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use netkit::{Privilege, check_binary};
use tracing::{debug, error, info, warn};

use crate::context::{ContextId, ContextRegistry};
use crate::daemon::ExecSpec;
use crate::error::{Error, Result};
use crate::node_state::remove_if_exists;
use crate::utils::{pid_alive, poll_until, process_cmdline, read_pid_file, write_atomic};

const POLL_STEP: Duration = Duration::from_millis(50);
const CONSOLE_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const LOG_TAIL_BYTES: u64 = 512;

pub const DEFAULT_STARTUP_PROBE: Duration = Duration::from_millis(500);
pub const DEFAULT_LAUNCH_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);
pub const DEFAULT_KILL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug)]
pub struct SupervisorConfig {
    /// How long a fresh process must stay up to count as started.
    pub startup_probe: Duration,
    /// Upper bound on waiting for the console listener.
    pub launch_timeout: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub grace_period: Duration,
    /// Time allowed for the process to disappear after SIGKILL.
    pub kill_timeout: Duration,
    pub wait_for_console: bool,
    /// Used to signal processes we cannot signal directly.
    pub privilege: Privilege,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            startup_probe: DEFAULT_STARTUP_PROBE,
            launch_timeout: DEFAULT_LAUNCH_TIMEOUT,
            grace_period: DEFAULT_GRACE_PERIOD,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
            wait_for_console: false,
            privilege: Privilege::detect(),
        }
    }
}

/// Where a node's management console listens. Only reachable from inside
/// `netns`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsoleAddr {
    pub netns: String,
    pub port: u16,
    pub credential: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited within the grace period after SIGTERM.
    Graceful,
    /// Had already exited before stop was called.
    AlreadyExited,
}

/// A supervised daemon process.
///
/// Owns the OS child. `context` only names the context the process runs in;
/// the context registry owns the context itself.
#[derive(Debug)]
pub struct ProcessHandle {
    node: String,
    context: ContextId,
    pid: u32,
    binary: PathBuf,
    child: Child,
    pid_path: PathBuf,
    log_path: PathBuf,
    console: ConsoleAddr,
    started_at: Instant,
    exit: Option<ExitStatus>,
}

impl ProcessHandle {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub fn pid_path(&self) -> &Path {
        &self.pid_path
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn console(&self) -> &ConsoleAddr {
        &self.console
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Exit status once the process has been observed to exit.
    pub fn exit_status(&self) -> Option<ExitStatus> {
        self.exit
    }

    /// Non-blocking reap. Returns the exit status once the child is gone.
    fn poll_exit(&mut self) -> Option<ExitStatus> {
        if self.exit.is_none() {
            match self.child.try_wait() {
                Ok(status) => self.exit = status,
                Err(e) => debug!(node = %self.node, pid = self.pid, "try_wait failed: {e}"),
            }
        }
        self.exit
    }
}

#[derive(Debug)]
pub struct ProcessSupervisor {
    contexts: Arc<ContextRegistry>,
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(contexts: Arc<ContextRegistry>, config: SupervisorConfig) -> Self {
        Self { contexts, config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Start `spec` for `node` inside context `ctx`.
    ///
    /// The PID file is written before this returns. The process must survive
    /// the startup probe; when console waiting is enabled its console must
    /// accept connections within the launch timeout.
    pub fn launch(&self, node: &str, ctx: ContextId, spec: &ExecSpec) -> Result<ProcessHandle> {
        let failed = |reason: String| Error::LaunchFailed {
            node: node.to_string(),
            reason,
        };

        let env = self
            .contexts
            .enter(ctx)
            .map_err(|_| failed(format!("context {ctx} does not exist")))?;
        let binary = resolve_binary(&spec.binary)
            .ok_or_else(|| failed(format!("binary {} not found", spec.binary.display())))?;

        self.clear_stale_pid(node, &spec.pid_path, &binary)?;

        let log = File::create(&spec.log_path).map_err(|e| Error::io(&spec.log_path, e))?;
        let log_err = log.try_clone().map_err(|e| Error::io(&spec.log_path, e))?;

        let mut cmd = env.command(&binary.to_string_lossy());
        cmd.args(&spec.args)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .process_group(0);

        let child = cmd
            .spawn()
            .map_err(|e| failed(format!("spawn {}: {e}", binary.display())))?;
        let pid = child.id();

        let mut handle = ProcessHandle {
            node: node.to_string(),
            context: ctx,
            pid,
            binary,
            child,
            pid_path: spec.pid_path.clone(),
            log_path: spec.log_path.clone(),
            console: ConsoleAddr {
                netns: env.netns().to_string(),
                port: spec.console.port,
                credential: spec.console.credential.clone(),
            },
            started_at: Instant::now(),
            exit: None,
        };

        if let Err(e) = write_atomic(&spec.pid_path, &format!("{pid}\n")) {
            self.abort(&mut handle);
            return Err(Error::io(&spec.pid_path, e));
        }

        let exited = poll_until(self.config.startup_probe, POLL_STEP, || {
            handle.poll_exit().is_some()
        });
        if exited {
            let status = handle
                .exit
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown status".into());
            discard_pid_file(&handle.pid_path);
            return Err(failed(format!(
                "exited during startup ({status}): {}",
                log_tail(&handle.log_path)
            )));
        }

        if self.config.wait_for_console && handle.console.port != 0 {
            let port = handle.console.port;
            let up = poll_until(self.config.launch_timeout, POLL_STEP, || {
                handle.poll_exit().is_some() || env.probe_tcp(port, CONSOLE_PROBE_TIMEOUT)
            });
            if handle.exit.is_some() {
                discard_pid_file(&handle.pid_path);
                return Err(failed(format!(
                    "exited before console came up: {}",
                    log_tail(&handle.log_path)
                )));
            }
            if !up {
                self.abort(&mut handle);
                return Err(failed(format!(
                    "console port {port} not listening after {:?}",
                    self.config.launch_timeout
                )));
            }
        }

        info!(node, pid, ns = %handle.console.netns, binary = %handle.binary.display(), "daemon started");
        Ok(handle)
    }

    /// Stop the process: SIGTERM to its group, then SIGKILL after the grace
    /// period. The PID file is removed once the process is gone; a process
    /// that outlives SIGKILL keeps it.
    pub fn stop(&self, handle: &mut ProcessHandle) -> Result<StopOutcome> {
        let outcome = self.terminate(handle);
        release_pid_file(handle)?;
        outcome
    }

    fn terminate(&self, handle: &mut ProcessHandle) -> Result<StopOutcome> {
        if handle.poll_exit().is_some() {
            debug!(node = %handle.node, pid = handle.pid, "already exited");
            return Ok(StopOutcome::AlreadyExited);
        }

        self.signal(handle, libc::SIGTERM);
        if poll_until(self.config.grace_period, POLL_STEP, || {
            handle.poll_exit().is_some()
        }) {
            info!(node = %handle.node, pid = handle.pid, "daemon stopped");
            return Ok(StopOutcome::Graceful);
        }

        warn!(
            node = %handle.node,
            pid = handle.pid,
            grace = ?self.config.grace_period,
            "daemon ignored SIGTERM, killing"
        );
        self.signal(handle, libc::SIGKILL);
        if !poll_until(self.config.kill_timeout, POLL_STEP, || {
            handle.poll_exit().is_some()
        }) {
            error!(node = %handle.node, pid = handle.pid, "daemon survived SIGKILL");
        }
        Err(Error::StopTimeout {
            node: handle.node.clone(),
            pid: handle.pid,
        })
    }

    /// Non-blocking liveness check.
    pub fn is_alive(&self, handle: &mut ProcessHandle) -> bool {
        handle.poll_exit().is_none()
    }

    /// Kill without grace and reap. Used when a launch is abandoned.
    fn abort(&self, handle: &mut ProcessHandle) {
        self.signal(handle, libc::SIGKILL);
        if !poll_until(self.config.kill_timeout, POLL_STEP, || {
            handle.poll_exit().is_some()
        }) {
            error!(node = %handle.node, pid = handle.pid, "abandoned daemon survived SIGKILL");
        }
        if let Err(e) = release_pid_file(handle) {
            warn!(node = %handle.node, "{e}");
        }
    }

    fn signal(&self, handle: &ProcessHandle, sig: libc::c_int) {
        let Ok(pgid) = libc::pid_t::try_from(handle.pid) else {
            return;
        };
        // SAFETY: kill(2) on the process group created for this child
        if unsafe { libc::kill(-pgid, sig) } == 0 {
            return;
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => {}
            // Started through sudo; signal with the same privilege.
            Some(libc::EPERM) => {
                let sig = sig.to_string();
                let target = format!("-{pgid}");
                if let Err(e) = self
                    .config
                    .privilege
                    .run_checked(&["kill", "-s", &sig, "--", &target])
                {
                    warn!(node = %handle.node, pid = handle.pid, "privileged kill failed: {e:#}");
                }
            }
            _ => warn!(node = %handle.node, pid = handle.pid, "kill({sig}) failed: {err}"),
        }
    }

    /// A PID file left by an earlier run: removed unless it names a live
    /// process running the same binary.
    fn clear_stale_pid(&self, node: &str, pid_path: &Path, binary: &Path) -> Result<()> {
        let Some(pid) = read_pid_file(pid_path) else {
            return remove_if_exists(pid_path);
        };
        if pid_alive(pid) && cmdline_matches(pid, binary) {
            return Err(Error::AlreadyRunning {
                node: node.to_string(),
                pid,
            });
        }
        debug!(node, pid, "removing stale pid file");
        remove_if_exists(pid_path)
    }
}

/// Remove the PID file if the process has exited. A live process keeps it
/// so the next launch sees the node as running.
pub(crate) fn release_pid_file(handle: &mut ProcessHandle) -> Result<()> {
    if handle.poll_exit().is_none() {
        error!(
            node = %handle.node,
            pid = handle.pid,
            path = %handle.pid_path.display(),
            "daemon still running, keeping pid file"
        );
        return Ok(());
    }
    remove_if_exists(&handle.pid_path)
}

fn discard_pid_file(path: &Path) {
    if let Err(e) = remove_if_exists(path) {
        warn!("{e}");
    }
}

/// Absolute or relative paths are taken as is; bare names go through `PATH`.
fn resolve_binary(binary: &Path) -> Option<PathBuf> {
    if binary.components().count() > 1 {
        return binary.is_file().then(|| binary.to_path_buf());
    }
    check_binary(&binary.to_string_lossy())
}

fn cmdline_matches(pid: u32, binary: &Path) -> bool {
    let Some(cmdline) = process_cmdline(pid) else {
        return false;
    };
    let name = binary
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    !name.is_empty()
        && cmdline
            .split_whitespace()
            .any(|word| Path::new(word).file_name().is_some_and(|f| f.to_string_lossy() == name))
}

/// Last few hundred bytes of a log, for error messages.
fn log_tail(path: &Path) -> String {
    let Ok(mut file) = File::open(path) else {
        return String::new();
    };
    let len = fs::metadata(path).map(|m| m.len()).unwrap_or(0);
    let _ = file.seek(SeekFrom::Start(len.saturating_sub(LOG_TAIL_BYTES)));
    let mut buf = Vec::new();
    let _ = file.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).trim().to_string()
}
