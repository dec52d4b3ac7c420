//! Topology realization and teardown.
//!
//! [`TopologyBuilder::build`] turns a [`Topology`] into a [`RunningTopology`]
//! in phases: validate, pre-flight router config, create contexts (in
//! parallel), wire links, then launch daemons. A failure in any phase tears
//! down whatever was created before the error is returned.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use netkit::NetBackend;
use tracing::{debug, error, info, warn};

use crate::config::LabConfig;
use crate::context::{ContextId, ContextKind, ContextRegistry, ExecEnv};
use crate::error::{BuildPhase, Error, Result};
use crate::link::{Endpoint, LinkId, LinkRegistry};
use crate::naming::{ClaimOutcome, InstanceId, NameAllocator};
use crate::node_state::NodeState;
use crate::reconcile::{DesiredState, RouterRuntime, SharedRouters, lock_routers};
use crate::supervisor::{ConsoleAddr, ProcessHandle, ProcessSupervisor};
use crate::topology::{NodeSpec, PlannedEnd, Role, Topology, TopologyPlan};

/// Failures collected while tearing down. Teardown never stops early.
#[derive(Debug, Default)]
pub struct TeardownReport {
    pub errors: Vec<Error>,
    /// Non-fatal problems, such as a daemon that had to be killed.
    pub warnings: Vec<Error>,
}

impl TeardownReport {
    pub fn push(&mut self, err: Error) {
        if err.is_fatal() {
            self.errors.push(err);
        } else {
            self.warnings.push(err);
        }
    }

    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for TeardownReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors, {} warnings", self.errors.len(), self.warnings.len())?;
        for e in self.errors.iter().chain(&self.warnings) {
            write!(f, "\n  {e}")?;
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct TopologyBuilder {
    backend: Arc<dyn NetBackend>,
    config: LabConfig,
}

impl TopologyBuilder {
    pub fn new(backend: Arc<dyn NetBackend>, config: LabConfig) -> Self {
        Self { backend, config }
    }

    pub fn config(&self) -> &LabConfig {
        &self.config
    }

    pub fn build(&self, topo: &Topology) -> Result<RunningTopology> {
        let plan = topo
            .plan()
            .map_err(|e| Error::build(BuildPhase::Validate, None, e))?;

        let node_state = NodeState::new(
            &self.config.base_dir,
            self.config.dir_mode,
            self.config.daemon_owner,
        );
        for router in plan.routers() {
            node_state
                .check_config(&router.name, router.config_dir.as_deref())
                .map_err(|e| Error::build(BuildPhase::Preflight, Some(&router.name), e))?;
        }

        let instance = InstanceId::random();
        let names = Arc::new(NameAllocator::new(
            instance,
            &self.config.prefix,
            node_state.run_dir(),
        ));
        let contexts = Arc::new(ContextRegistry::new(
            Arc::clone(&self.backend),
            Arc::clone(&names),
        ));
        let links = Arc::new(LinkRegistry::new(
            Arc::clone(&self.backend),
            Arc::clone(&contexts),
            Arc::clone(&names),
        ));
        let supervisor = Arc::new(ProcessSupervisor::new(
            Arc::clone(&contexts),
            self.config.supervisor,
        ));

        let mut running = RunningTopology {
            instance,
            plan: Arc::new(plan),
            node_state,
            names,
            contexts,
            links,
            supervisor,
            nodes: BTreeMap::new(),
            link_ids: Vec::new(),
            routers: Arc::new(Mutex::new(BTreeMap::new())),
            torn_down: false,
        };

        info!(
            %instance,
            nodes = running.plan.nodes.len(),
            links = running.plan.links.len(),
            "building topology"
        );
        if let Err(e) = self.realize(&mut running) {
            error!("build failed, unwinding: {e}");
            let report = running.teardown();
            if !report.is_clean() {
                warn!("unwind incomplete: {report}");
            }
            return Err(e);
        }
        info!(%instance, "topology running");
        Ok(running)
    }

    /// Remove what an abnormally terminated run left behind: namespaces
    /// whose claim names a dead process, and PID files of dead daemons.
    /// Returns the names of removed namespaces.
    pub fn clean_stale(&self) -> Result<Vec<String>> {
        let node_state = NodeState::new(
            &self.config.base_dir,
            self.config.dir_mode,
            self.config.daemon_owner,
        );
        let names = NameAllocator::new(InstanceId::random(), &self.config.prefix, node_state.run_dir());

        let mut removed = Vec::new();
        for (netns, _) in names.stale_claims()? {
            // Take the claim first so a build reclaiming the same name
            // concurrently cannot lose its namespace to us.
            let claim = match names.claim(&netns, true) {
                Ok(ClaimOutcome::Reclaimed(claim)) => claim,
                Ok(ClaimOutcome::Fresh) => {
                    names.release(&netns)?;
                    continue;
                }
                Err(Error::NameCollision { .. }) => {
                    debug!(ns = %netns, "stale claim taken over by another run");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let exists = self
                .backend
                .netns_exists(&netns)
                .map_err(|e| Error::from_host("namespace lookup", &netns, e));
            let deleted = exists.and_then(|exists| {
                if exists {
                    self.backend
                        .netns_del(&netns)
                        .map_err(|e| Error::from_host("stale namespace", &netns, e))?;
                }
                Ok(())
            });
            names.release(&netns)?;
            deleted?;
            info!(ns = %netns, owner = %claim, "removed stale namespace");
            removed.push(netns);
        }

        for node in node_state.stale_pid_files()? {
            node_state.clean_pid(&node)?;
            debug!(node = %node, "removed stale pid file");
        }
        Ok(removed)
    }

    fn realize(&self, running: &mut RunningTopology) -> Result<()> {
        running
            .node_state
            .prepare()
            .map_err(|e| Error::build(BuildPhase::Contexts, None, e))?;
        self.create_contexts(running)?;
        self.wire_links(running)?;
        // Every context and link exists past this point.
        self.launch_routers(running)
    }

    fn create_contexts(&self, running: &mut RunningTopology) -> Result<()> {
        let plan = Arc::clone(&running.plan);
        let contexts = Arc::clone(&running.contexts);
        let mut first_err = None;

        for chunk in plan.nodes.chunks(self.config.build_parallelism.max(1)) {
            let results: Vec<(&NodeSpec, Result<ContextId>)> = std::thread::scope(|s| {
                let workers: Vec<_> = chunk
                    .iter()
                    .map(|node| {
                        let contexts = &contexts;
                        (node, s.spawn(move || contexts.create(&node.name, context_kind(node.role))))
                    })
                    .collect();
                workers
                    .into_iter()
                    .map(|(node, worker)| {
                        let result = worker.join().unwrap_or_else(|_| {
                            Err(Error::Host {
                                op: format!("namespace for '{}'", node.name),
                                reason: "worker thread panicked".into(),
                            })
                        });
                        (node, result)
                    })
                    .collect()
            });

            for (node, result) in results {
                match result {
                    Ok(id) => {
                        running.nodes.insert(node.name.clone(), id);
                    }
                    Err(e) if first_err.is_none() => {
                        first_err = Some(Error::build(BuildPhase::Contexts, Some(&node.name), e));
                    }
                    Err(e) => debug!(node = %node.name, "additional context failure: {e}"),
                }
            }
            if let Some(e) = first_err.take() {
                return Err(e);
            }
        }
        Ok(())
    }

    fn wire_links(&self, running: &mut RunningTopology) -> Result<()> {
        let plan = Arc::clone(&running.plan);
        for link in &plan.links {
            let a = running.endpoint(&link.a)?;
            let b = running.endpoint(&link.b)?;
            let id = running
                .links
                .connect(a, b)
                .map_err(|e| Error::build(BuildPhase::Links, Some(&link.a.node), e))?;
            running.link_ids.push(id);

            for end in [&link.a, &link.b] {
                let ctx = running.context_of(&end.node)?;
                let wrap = |e| Error::build(BuildPhase::Links, Some(&end.node), e);
                if end.role == Role::Switch {
                    running.contexts.add_switch_port(ctx, &end.iface).map_err(wrap)?;
                }
                if let Some(addr) = &end.addr {
                    running.contexts.add_address(ctx, &end.iface, addr).map_err(wrap)?;
                }
                if !link.shaping.is_empty() {
                    running.contexts.shape(ctx, &end.iface, &link.shaping).map_err(wrap)?;
                }
            }
            debug!(
                a = %format!("{}:{}", link.a.node, link.a.iface),
                b = %format!("{}:{}", link.b.node, link.b.iface),
                "wired"
            );
        }
        Ok(())
    }

    fn launch_routers(&self, running: &mut RunningTopology) -> Result<()> {
        let plan = Arc::clone(&running.plan);
        for router in plan.routers() {
            let name = router.name.as_str();
            let wrap = |e| Error::build(BuildPhase::Launch, Some(name), e);
            let ctx = running.context_of(name)?;
            let paths = running
                .node_state
                .ensure(name, router.config_dir.as_deref())
                .map_err(wrap)?;
            let exec = self
                .config
                .daemon
                .render(name, &paths, router.console_credential.as_deref());
            let handle = running.supervisor.launch(name, ctx, &exec).map_err(wrap)?;
            lock_routers(&running.routers).insert(
                name.to_string(),
                RouterRuntime::new(name, ctx, paths, exec, handle),
            );
        }
        Ok(())
    }
}

fn context_kind(role: Role) -> ContextKind {
    match role {
        Role::Switch => ContextKind::Switch,
        Role::Host | Role::Router => ContextKind::Node,
    }
}

/// A realized topology. Tears itself down when dropped.
#[derive(Debug)]
pub struct RunningTopology {
    instance: InstanceId,
    plan: Arc<TopologyPlan>,
    node_state: NodeState,
    names: Arc<NameAllocator>,
    contexts: Arc<ContextRegistry>,
    links: Arc<LinkRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    nodes: BTreeMap<String, ContextId>,
    link_ids: Vec<LinkId>,
    routers: SharedRouters,
    torn_down: bool,
}

impl RunningTopology {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn plan(&self) -> &TopologyPlan {
        &self.plan
    }

    pub fn node_state(&self) -> &NodeState {
        &self.node_state
    }

    pub fn supervisor(&self) -> &Arc<ProcessSupervisor> {
        &self.supervisor
    }

    pub fn routers(&self) -> &SharedRouters {
        &self.routers
    }

    /// Host namespace name `node` maps to in this instance.
    pub fn netns_name(&self, node: &str) -> String {
        self.names.netns_name(node)
    }

    pub fn context_of(&self, node: &str) -> Result<ContextId> {
        self.nodes
            .get(node)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("node '{node}'")))
    }

    fn endpoint(&self, end: &PlannedEnd) -> Result<Endpoint> {
        Ok(Endpoint::new(self.context_of(&end.node)?, &end.iface))
    }

    /// Execution environment inside `node`'s namespace.
    pub fn enter_namespace(&self, node: &str) -> Result<ExecEnv> {
        self.contexts.enter(self.context_of(node)?)
    }

    pub fn context_count(&self) -> usize {
        self.contexts.count()
    }

    pub fn link_count(&self) -> usize {
        self.links.count()
    }

    /// Routers whose daemon is currently alive.
    pub fn running_daemons(&self) -> usize {
        let mut routers = lock_routers(&self.routers);
        routers
            .values_mut()
            .filter_map(|rt| rt.process.as_mut())
            .map(|p| self.supervisor.is_alive(p))
            .filter(|&alive| alive)
            .count()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down
    }

    /// Cheap shared view for sessions and status reporting.
    pub fn view(&self) -> TopologyView {
        TopologyView {
            instance: self.instance,
            plan: Arc::clone(&self.plan),
            nodes: self.nodes.clone(),
            contexts: Arc::clone(&self.contexts),
            links: Arc::clone(&self.links),
            supervisor: Arc::clone(&self.supervisor),
            routers: Arc::clone(&self.routers),
        }
    }

    /// Disconnect links, stop daemons, destroy contexts. Errors are collected,
    /// never short-circuited. A second call is a no-op.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.torn_down {
            return report;
        }
        self.torn_down = true;

        for id in self.link_ids.drain(..).rev() {
            if let Err(e) = self.links.disconnect(id) {
                report.push(e);
            }
        }

        let handles: Vec<ProcessHandle> = lock_routers(&self.routers)
            .values_mut()
            .filter_map(|rt| {
                rt.desired = DesiredState::Stopped;
                rt.process.take()
            })
            .collect();
        for mut handle in handles {
            if let Err(e) = self.supervisor.stop(&mut handle) {
                report.push(e);
            }
        }

        for id in self.contexts.ids().into_iter().rev() {
            if let Err(e) = self.contexts.destroy(id) {
                report.push(e);
            }
        }
        self.nodes.clear();

        info!(
            instance = %self.instance,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "topology torn down"
        );
        report
    }
}

impl Drop for RunningTopology {
    fn drop(&mut self) {
        if !self.torn_down {
            let report = self.teardown();
            if !report.is_clean() {
                warn!("teardown on drop: {report}");
            }
        }
    }
}

/// Shared, cloneable handle onto a running topology.
#[derive(Clone, Debug)]
pub struct TopologyView {
    instance: InstanceId,
    plan: Arc<TopologyPlan>,
    nodes: BTreeMap<String, ContextId>,
    contexts: Arc<ContextRegistry>,
    links: Arc<LinkRegistry>,
    supervisor: Arc<ProcessSupervisor>,
    routers: SharedRouters,
}

impl TopologyView {
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn plan(&self) -> &TopologyPlan {
        &self.plan
    }

    pub fn node_names(&self) -> impl Iterator<Item = &str> {
        self.plan.nodes.iter().map(|n| n.name.as_str())
    }

    pub fn enter_namespace(&self, node: &str) -> Result<ExecEnv> {
        let ctx = self
            .nodes
            .get(node)
            .copied()
            .ok_or_else(|| Error::NotFound(format!("node '{node}'")))?;
        self.contexts.enter(ctx)
    }

    /// Console address of a router's daemon, if it is running.
    pub fn console(&self, node: &str) -> Result<ConsoleAddr> {
        let routers = lock_routers(&self.routers);
        let rt = routers
            .get(node)
            .ok_or_else(|| Error::NotFound(format!("router '{node}'")))?;
        rt.process
            .as_ref()
            .map(|p| p.console().clone())
            .ok_or_else(|| Error::NotFound(format!("daemon of '{node}' is not running")))
    }

    pub(crate) fn interfaces(&self, node: &str) -> Vec<String> {
        self.nodes
            .get(node)
            .map(|ctx| self.contexts.interfaces(*ctx))
            .unwrap_or_default()
    }

    pub(crate) fn netns(&self, node: &str) -> Option<String> {
        self.nodes.get(node).and_then(|ctx| self.contexts.netns_name(*ctx))
    }

    pub(crate) fn link_count(&self) -> usize {
        self.links.count()
    }

    pub(crate) fn supervisor(&self) -> &ProcessSupervisor {
        &self.supervisor
    }

    pub(crate) fn routers(&self) -> &SharedRouters {
        &self.routers
    }
}
