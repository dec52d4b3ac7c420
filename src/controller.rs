//! Topology lifecycle state machine.
//!
//! ```text
//! Idle --build--> Building --ok--> Running --teardown--> TearingDown --> Idle
//!                     \--err--> Idle
//! ```
//!
//! While running, a reconciler task observes the router daemons and reports
//! exits as [`NodeEvent`]s; they do not change the controller state.

use std::fmt;
use std::sync::Arc;

use netkit::NetBackend;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::builder::{RunningTopology, TeardownReport, TopologyBuilder, TopologyView};
use crate::config::LabConfig;
use crate::context::ExecEnv;
use crate::error::{Error, Result};
use crate::reconcile::{NodeEvent, Reconciler};
use crate::session::Session;
use crate::topology::Topology;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    Building,
    Running,
    TearingDown,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Idle => write!(f, "idle"),
            ControllerState::Building => write!(f, "building"),
            ControllerState::Running => write!(f, "running"),
            ControllerState::TearingDown => write!(f, "tearing down"),
        }
    }
}

/// What [`TopologyController::run`] does once the session ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WatchMode {
    #[default]
    TeardownOnExit,
    /// Leave the topology up; the caller tears down later.
    KeepRunning,
}

#[derive(Debug)]
struct Observer {
    reconciler: Arc<Reconciler>,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

#[derive(Debug)]
pub struct TopologyController {
    builder: TopologyBuilder,
    state: ControllerState,
    running: Option<RunningTopology>,
    observer: Option<Observer>,
}

impl TopologyController {
    pub fn new(backend: Arc<dyn NetBackend>, config: LabConfig) -> Self {
        Self {
            builder: TopologyBuilder::new(backend, config),
            state: ControllerState::Idle,
            running: None,
            observer: None,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn running(&self) -> Option<&RunningTopology> {
        self.running.as_ref()
    }

    pub fn view(&self) -> Option<TopologyView> {
        self.running.as_ref().map(RunningTopology::view)
    }

    fn expect_state(&self, op: &'static str, want: ControllerState) -> Result<()> {
        if self.state != want {
            return Err(Error::InvalidState {
                op,
                state: self.state.to_string(),
            });
        }
        Ok(())
    }

    /// Realize `topo`. Blocking.
    pub fn build(&mut self, topo: &Topology) -> Result<TopologyView> {
        self.expect_state("build", ControllerState::Idle)?;
        self.state = ControllerState::Building;
        match self.builder.build(topo) {
            Ok(running) => {
                let view = running.view();
                self.running = Some(running);
                self.state = ControllerState::Running;
                Ok(view)
            }
            Err(e) => {
                self.state = ControllerState::Idle;
                Err(e)
            }
        }
    }

    /// Spawn the reconciler on the current tokio runtime. Events arrive on
    /// the returned channel until teardown.
    pub fn start_observer(&mut self) -> Result<UnboundedReceiver<NodeEvent>> {
        self.expect_state("start_observer", ControllerState::Running)?;
        let running = self.running.as_ref().ok_or_else(|| Error::InvalidState {
            op: "start_observer",
            state: "without topology".into(),
        })?;
        if let Some(old) = self.observer.take() {
            stop_observer(old);
        }

        let config = self.builder.config();
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(running.routers()),
            Arc::clone(running.supervisor()),
            config.restart,
        ));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = Arc::clone(&reconciler).spawn(config.reconcile_interval, events_tx, shutdown_rx);
        self.observer = Some(Observer {
            reconciler,
            shutdown: shutdown_tx,
            task,
        });
        Ok(events_rx)
    }

    /// Tear the running topology down. Blocking.
    pub fn teardown(&mut self) -> Result<TeardownReport> {
        self.expect_state("teardown", ControllerState::Running)?;
        self.state = ControllerState::TearingDown;
        if let Some(observer) = self.observer.take() {
            stop_observer(observer);
        }
        let report = match self.running.take() {
            Some(mut running) => running.teardown(),
            None => TeardownReport::default(),
        };
        self.state = ControllerState::Idle;
        if report.is_clean() {
            info!("teardown complete");
        } else {
            warn!("teardown finished with {report}");
        }
        Ok(report)
    }

    pub fn enter_namespace(&self, node: &str) -> Result<ExecEnv> {
        self.expect_state("enter_namespace", ControllerState::Running)?;
        match &self.running {
            Some(running) => running.enter_namespace(node),
            None => Err(Error::NotFound(format!("node '{node}'"))),
        }
    }

    /// Build, observe, hand the topology to `session`, and (with
    /// [`WatchMode::TeardownOnExit`]) tear down when the session ends or
    /// Ctrl-C arrives.
    ///
    /// Needs a multi-threaded tokio runtime: building and teardown block.
    pub async fn run<S: Session>(
        &mut self,
        topo: &Topology,
        session: &mut S,
        mode: WatchMode,
    ) -> Result<Option<TeardownReport>> {
        let view = tokio::task::block_in_place(|| self.build(topo))?;
        let events = self.start_observer()?;

        let outcome = tokio::select! {
            r = session.run(view, events) => r,
            _ = interrupted() => {
                info!("interrupted");
                Ok(())
            }
        };

        match mode {
            WatchMode::KeepRunning => outcome.map(|()| None),
            WatchMode::TeardownOnExit => {
                let report = tokio::task::block_in_place(|| self.teardown())?;
                outcome.map(|()| Some(report))
            }
        }
    }
}

/// Resolves on Ctrl-C; never, if the signal cannot be watched.
async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {e}");
        std::future::pending::<()>().await;
    }
}

/// Blocks until a reconcile pass in progress has finished.
fn stop_observer(observer: Observer) {
    observer.reconciler.shutdown();
    let _ = observer.shutdown.send(true);
    observer.task.abort();
}

impl Drop for TopologyController {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            stop_observer(observer);
        }
        if let Some(mut running) = self.running.take() {
            let report = running.teardown();
            if !report.is_clean() {
                warn!("teardown on drop: {report}");
            }
        }
    }
}
