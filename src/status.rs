//! Serializable snapshot of a running topology.

use std::path::PathBuf;

use serde::Serialize;

use crate::builder::TopologyView;
use crate::reconcile::{DesiredState, lock_routers};
use crate::topology::Role;

/// Per-router daemon state.
#[derive(Clone, Debug, Serialize)]
pub struct DaemonStatus {
    /// PID of the live process; `None` after it exited.
    pub pid: Option<u32>,
    pub alive: bool,
    /// False once the daemon was stopped or the restart limit was hit.
    pub wanted: bool,
    pub restarts: u32,
    pub last_exit_code: Option<i32>,
    pub console_port: u16,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
}

#[derive(Clone, Debug, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub role: Role,
    /// Host namespace backing the node.
    pub netns: Option<String>,
    pub interfaces: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daemon: Option<DaemonStatus>,
}

#[derive(Clone, Debug, Serialize)]
pub struct LinkStatus {
    /// `node:iface`
    pub a: String,
    pub b: String,
    /// netem arguments applied on both ends, empty when unshaped
    pub shaping: Vec<String>,
}

#[derive(Clone, Debug, Serialize)]
pub struct TopologyStatus {
    pub instance: String,
    pub nodes: Vec<NodeStatus>,
    pub links: Vec<LinkStatus>,
    /// Links currently wired on the host.
    pub live_links: usize,
}

impl TopologyStatus {
    /// Probe every daemon (non-blocking) and collect the current picture.
    pub fn collect(view: &TopologyView) -> Self {
        let mut routers = lock_routers(view.routers());
        let nodes = view
            .plan()
            .nodes
            .iter()
            .map(|node| {
                let daemon = routers.get_mut(&node.name).map(|rt| {
                    let alive = rt
                        .process
                        .as_mut()
                        .is_some_and(|p| view.supervisor().is_alive(p));
                    DaemonStatus {
                        pid: rt.pid().filter(|_| alive),
                        alive,
                        wanted: rt.desired == DesiredState::Running,
                        restarts: rt.restarts,
                        last_exit_code: rt.last_exit.and_then(|s| s.code()),
                        console_port: rt.exec.console.port,
                        log_path: rt.paths.log_path.clone(),
                        pid_path: rt.paths.pid_path.clone(),
                    }
                });
                NodeStatus {
                    name: node.name.clone(),
                    role: node.role,
                    netns: view.netns(&node.name),
                    interfaces: view.interfaces(&node.name),
                    daemon,
                }
            })
            .collect();
        drop(routers);

        let links = view
            .plan()
            .links
            .iter()
            .map(|link| LinkStatus {
                a: format!("{}:{}", link.a.node, link.a.iface),
                b: format!("{}:{}", link.b.node, link.b.iface),
                shaping: link.shaping.netem_args(),
            })
            .collect();

        Self {
            instance: view.instance().to_string(),
            nodes,
            links,
            live_links: view.link_count(),
        }
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    /// Routers whose daemon is alive.
    pub fn running_daemons(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.daemon.as_ref().is_some_and(|d| d.alive))
            .count()
    }
}
