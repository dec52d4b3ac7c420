//! Desired-vs-observed control loop for router daemons.
//!
//! Each pass probes every router that should be running without blocking.
//! Exits are reported as [`NodeEvent`]s; under [`RestartPolicy::OnFailure`]
//! the daemon is relaunched with exponential backoff. Relaunches run with the
//! router table unlocked so teardown is never held up by a slow startup;
//! [`Reconciler::shutdown`] waits for an in-flight pass instead, so nothing
//! is relaunched behind a teardown's back.

use std::collections::BTreeMap;
use std::fmt;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::context::ContextId;
use crate::daemon::ExecSpec;
use crate::node_state::NodePaths;
use crate::supervisor::{ProcessHandle, ProcessSupervisor};

pub const DEFAULT_RESTART_BASE_DELAY: Duration = Duration::from_millis(500);
const MAX_RESTART_DELAY: Duration = Duration::from_secs(30);
const MAX_BACKOFF_COUNT: u32 = 6;
/// A daemon up this long has recovered; its backoff and restart count start
/// over.
pub const DEFAULT_STABLE_UPTIME: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DesiredState {
    Running,
    Stopped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RestartPolicy {
    /// Report exits only.
    #[default]
    Never,
    OnFailure { max_restarts: u32, base_delay: Duration },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeEvent {
    Exited { node: String, code: Option<i32> },
    Restarted { node: String, pid: u32 },
    RestartFailed { node: String, reason: String },
    GaveUp { node: String, attempts: u32 },
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeEvent::Exited { node, code: Some(code) } => write!(f, "{node}: daemon exited with code {code}"),
            NodeEvent::Exited { node, code: None } => write!(f, "{node}: daemon killed by signal"),
            NodeEvent::Restarted { node, pid } => write!(f, "{node}: daemon restarted (pid {pid})"),
            NodeEvent::RestartFailed { node, reason } => write!(f, "{node}: restart failed: {reason}"),
            NodeEvent::GaveUp { node, attempts } => {
                write!(f, "{node}: giving up after {attempts} restarts")
            }
        }
    }
}

/// Restart delay tracking with capped exponential backoff.
#[derive(Clone, Debug)]
pub struct RestartBackoff {
    base: Duration,
    failures: u32,
    last_attempt: Option<Instant>,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self::new(DEFAULT_RESTART_BASE_DELAY)
    }
}

impl RestartBackoff {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            failures: 0,
            last_attempt: None,
        }
    }

    /// Delay required since the last attempt, based on failure count.
    pub fn delay(&self) -> Duration {
        let capped = self.failures.min(MAX_BACKOFF_COUNT);
        self.base.saturating_mul(1u32 << capped).min(MAX_RESTART_DELAY)
    }

    pub fn should_attempt(&self, now: Instant) -> bool {
        match self.last_attempt {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.delay(),
        }
    }

    pub fn record_attempt(&mut self, node: &str, now: Instant) {
        if self.last_attempt.is_some() {
            self.failures = self.failures.saturating_add(1);
        }
        self.last_attempt = Some(now);
        debug!(node, failures = self.failures, next = ?self.delay(), "restart attempt");
    }

    pub fn mark_success(&mut self, node: &str) {
        if self.failures > 0 || self.last_attempt.is_some() {
            info!(node, "daemon stable, resetting restart backoff");
        }
        self.failures = 0;
        self.last_attempt = None;
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// Runtime state of one router node.
#[derive(Debug)]
pub struct RouterRuntime {
    pub node: String,
    pub context: ContextId,
    pub paths: NodePaths,
    pub exec: ExecSpec,
    pub process: Option<ProcessHandle>,
    pub desired: DesiredState,
    pub backoff: RestartBackoff,
    /// Restarts since the daemon last ran stably; `max_restarts` caps this.
    pub restarts: u32,
    pub last_exit: Option<ExitStatus>,
}

impl RouterRuntime {
    pub fn new(node: &str, context: ContextId, paths: NodePaths, exec: ExecSpec, process: ProcessHandle) -> Self {
        Self {
            node: node.to_string(),
            context,
            paths,
            exec,
            process: Some(process),
            desired: DesiredState::Running,
            backoff: RestartBackoff::default(),
            restarts: 0,
            last_exit: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }
}

pub type SharedRouters = Arc<Mutex<BTreeMap<String, RouterRuntime>>>;

pub(crate) fn lock_routers(routers: &SharedRouters) -> MutexGuard<'_, BTreeMap<String, RouterRuntime>> {
    routers.lock().unwrap_or_else(|e| e.into_inner())
}

#[derive(Debug)]
pub struct Reconciler {
    routers: SharedRouters,
    supervisor: Arc<ProcessSupervisor>,
    policy: RestartPolicy,
    stable_after: Duration,
    stopped: AtomicBool,
    /// Held for the whole of a pass.
    pass: Mutex<()>,
}

impl Reconciler {
    pub fn new(routers: SharedRouters, supervisor: Arc<ProcessSupervisor>, policy: RestartPolicy) -> Self {
        Self {
            routers,
            supervisor,
            policy,
            stable_after: DEFAULT_STABLE_UPTIME,
            stopped: AtomicBool::new(false),
            pass: Mutex::new(()),
        }
    }

    /// Uptime after which a restarted daemon counts as recovered.
    pub fn with_stable_after(mut self, stable_after: Duration) -> Self {
        self.stable_after = stable_after;
        self
    }

    /// Stop relaunching and wait for a pass in progress to finish. Blocking.
    ///
    /// A daemon started by that pass is already recorded in the router
    /// table when this returns, so a following teardown stops it.
    pub fn shutdown(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        drop(self.pass.lock().unwrap_or_else(|e| e.into_inner()));
        debug!("reconciler quiesced");
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// One observation pass. Returns what changed.
    pub fn reconcile_once(&self) -> Vec<NodeEvent> {
        let _pass = self.pass.lock().unwrap_or_else(|e| e.into_inner());
        if self.is_shut_down() {
            return Vec::new();
        }
        let now = Instant::now();
        let mut events = Vec::new();
        let mut due: Vec<(String, ContextId, ExecSpec)> = Vec::new();

        {
            let mut routers = lock_routers(&self.routers);
            for rt in routers.values_mut() {
                if rt.desired != DesiredState::Running {
                    continue;
                }
                if let Some(process) = rt.process.as_mut() {
                    if self.supervisor.is_alive(process) {
                        if process.uptime() >= self.stable_after && rt.backoff.last_attempt.is_some() {
                            rt.backoff.mark_success(&rt.node);
                            rt.restarts = 0;
                        }
                        continue;
                    }
                    let status = process.exit_status();
                    warn!(node = %rt.node, pid = process.pid(), ?status, "daemon exited");
                    events.push(NodeEvent::Exited {
                        node: rt.node.clone(),
                        code: status.and_then(|s| s.code()),
                    });
                    rt.last_exit = status;
                    rt.process = None;
                }

                let RestartPolicy::OnFailure { max_restarts, base_delay } = self.policy else {
                    continue;
                };
                if rt.restarts >= max_restarts {
                    warn!(node = %rt.node, attempts = rt.restarts, "restart limit reached");
                    events.push(NodeEvent::GaveUp {
                        node: rt.node.clone(),
                        attempts: rt.restarts,
                    });
                    rt.desired = DesiredState::Stopped;
                    continue;
                }
                if rt.backoff.last_attempt.is_none() {
                    rt.backoff.base = base_delay;
                }
                if rt.backoff.should_attempt(now) {
                    rt.backoff.record_attempt(&rt.node, now);
                    rt.restarts += 1;
                    due.push((rt.node.clone(), rt.context, rt.exec.clone()));
                }
            }
        }

        for (node, ctx, exec) in due {
            if self.is_shut_down() {
                break;
            }
            match self.supervisor.launch(&node, ctx, &exec) {
                Ok(mut handle) => {
                    let mut routers = lock_routers(&self.routers);
                    match routers.get_mut(&node) {
                        Some(rt) if rt.desired == DesiredState::Running && rt.process.is_none() => {
                            info!(node = %node, pid = handle.pid(), "daemon restarted");
                            events.push(NodeEvent::Restarted {
                                node: node.clone(),
                                pid: handle.pid(),
                            });
                            rt.process = Some(handle);
                        }
                        // Torn down while we were launching.
                        _ => {
                            drop(routers);
                            let reason = match self.supervisor.stop(&mut handle) {
                                Ok(_) => "router torn down during restart".to_string(),
                                Err(e) => format!("router torn down during restart, stop failed: {e}"),
                            };
                            warn!(node = %node, pid = handle.pid(), "{reason}");
                            events.push(NodeEvent::RestartFailed { node, reason });
                        }
                    }
                }
                Err(e) => {
                    warn!(node = %node, "restart failed: {e}");
                    events.push(NodeEvent::RestartFailed {
                        node,
                        reason: e.to_string(),
                    });
                }
            }
        }
        events
    }

    /// Run passes every `interval` until `shutdown` flips to true or its
    /// sender is dropped.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        events: mpsc::UnboundedSender<NodeEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }
                let this = Arc::clone(&self);
                match tokio::task::spawn_blocking(move || this.reconcile_once()).await {
                    Ok(batch) => {
                        for event in batch {
                            let _ = events.send(event);
                        }
                    }
                    Err(e) => warn!("reconcile pass failed: {e}"),
                }
            }
            debug!("reconciler stopped");
        })
    }
}
