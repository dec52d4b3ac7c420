use std::fmt;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};
use tracing::debug;

use crate::command::Privilege;
use crate::impairment::Shaping;

/// Directory where `ip netns` keeps its namespace bind mounts.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Host network operations the emulator needs.
///
/// `netns: None` addresses the host (default) namespace. Every call is a
/// single host operation; callers own sequencing and unwinding.
pub trait NetBackend: Send + Sync + fmt::Debug {
    fn netns_add(&self, name: &str) -> Result<()>;
    fn netns_del(&self, name: &str) -> Result<()>;
    fn netns_list(&self) -> Result<Vec<String>>;

    fn netns_exists(&self, name: &str) -> Result<bool> {
        Ok(self.netns_list()?.iter().any(|n| n == name))
    }

    /// Create a veth pair `a <-> b` in the host namespace.
    fn veth_add(&self, a: &str, b: &str) -> Result<()>;
    /// Move `iface` into `netns`, rename it to `new_name` and bring it up.
    fn link_move(&self, iface: &str, netns: &str, new_name: &str) -> Result<()>;
    /// Rename `iface` where it is and bring it up.
    fn link_rename(&self, netns: Option<&str>, iface: &str, new_name: &str) -> Result<()>;
    fn link_del(&self, netns: Option<&str>, iface: &str) -> Result<()>;
    fn link_exists(&self, netns: Option<&str>, iface: &str) -> Result<bool>;

    /// Create a learning bridge (STP off) inside `netns` and bring it up.
    fn bridge_add(&self, netns: &str, bridge: &str) -> Result<()>;
    fn bridge_attach(&self, netns: &str, bridge: &str, iface: &str) -> Result<()>;

    fn addr_add(&self, netns: &str, iface: &str, cidr: &str) -> Result<()>;
    fn shape(&self, netns: &str, iface: &str, shaping: &Shaping) -> Result<()>;

    /// A command that runs `program` inside `netns`.
    fn command_in(&self, netns: &str, program: &str) -> Command;

    /// Filesystem handle of `netns`, usable with `setns(2)`.
    fn netns_path(&self, netns: &str) -> PathBuf {
        PathBuf::from(NETNS_RUN_DIR).join(netns)
    }
}

/// [`NetBackend`] driving iproute2 (`ip`, `tc`) on the real host.
#[derive(Debug, Clone, Copy, Default)]
pub struct IpBackend {
    privilege: Privilege,
}

impl IpBackend {
    pub fn new(privilege: Privilege) -> Self {
        Self { privilege }
    }

    /// Backend with privilege detected from the effective uid.
    pub fn detect() -> Self {
        Self::new(Privilege::detect())
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    fn ip(&self, netns: Option<&str>, args: &[&str]) -> Result<()> {
        let mut full = vec!["ip"];
        if let Some(ns) = netns {
            full.extend_from_slice(&["-n", ns]);
        }
        full.extend_from_slice(args);
        self.privilege.run_checked(&full).map(|_| ())
    }
}

impl NetBackend for IpBackend {
    fn netns_add(&self, name: &str) -> Result<()> {
        self.ip(None, &["netns", "add", name])
            .with_context(|| format!("create netns '{name}'"))?;
        debug!(ns = name, "created network namespace");

        // Loopback is best-effort.
        if let Err(e) = self.ip(Some(name), &["link", "set", "lo", "up"]) {
            debug!(ns = name, "loopback not raised: {e:#}");
        }
        Ok(())
    }

    fn netns_del(&self, name: &str) -> Result<()> {
        debug!(ns = name, "deleting network namespace");
        self.ip(None, &["netns", "del", name])
            .with_context(|| format!("delete netns '{name}'"))
    }

    fn netns_list(&self) -> Result<Vec<String>> {
        let out = self.privilege.run_checked(&["ip", "netns", "list"])?;
        // Lines look like `name (id: 3)` or just `name`.
        Ok(String::from_utf8_lossy(&out.stdout)
            .lines()
            .filter_map(|l| l.split_whitespace().next())
            .map(str::to_string)
            .collect())
    }

    fn veth_add(&self, a: &str, b: &str) -> Result<()> {
        self.ip(None, &["link", "add", a, "type", "veth", "peer", "name", b])
            .with_context(|| format!("create veth pair {a} <-> {b}"))?;
        debug!(local = a, peer = b, "created veth pair");
        Ok(())
    }

    fn link_move(&self, iface: &str, netns: &str, new_name: &str) -> Result<()> {
        self.ip(None, &["link", "set", iface, "netns", netns])
            .with_context(|| format!("move {iface} into '{netns}'"))?;
        if iface != new_name {
            self.ip(Some(netns), &["link", "set", iface, "name", new_name])
                .with_context(|| format!("rename {iface} to {new_name} in '{netns}'"))?;
        }
        self.ip(Some(netns), &["link", "set", new_name, "up"])
            .with_context(|| format!("bring {new_name} up in '{netns}'"))
    }

    fn link_rename(&self, netns: Option<&str>, iface: &str, new_name: &str) -> Result<()> {
        if iface != new_name {
            self.ip(netns, &["link", "set", iface, "name", new_name])
                .with_context(|| format!("rename {iface} to {new_name}"))?;
        }
        self.ip(netns, &["link", "set", new_name, "up"])
            .with_context(|| format!("bring {new_name} up"))
    }

    fn link_del(&self, netns: Option<&str>, iface: &str) -> Result<()> {
        self.ip(netns, &["link", "del", iface])
            .with_context(|| format!("delete link {iface}"))
    }

    fn link_exists(&self, netns: Option<&str>, iface: &str) -> Result<bool> {
        let mut full = vec!["ip"];
        if let Some(ns) = netns {
            full.extend_from_slice(&["-n", ns]);
        }
        full.extend_from_slice(&["link", "show", iface]);
        Ok(self.privilege.run(&full)?.status.success())
    }

    fn bridge_add(&self, netns: &str, bridge: &str) -> Result<()> {
        self.ip(
            Some(netns),
            &["link", "add", "name", bridge, "type", "bridge", "stp_state", "0"],
        )
        .with_context(|| format!("create bridge {bridge} in '{netns}'"))?;
        self.ip(Some(netns), &["link", "set", bridge, "up"])?;
        debug!(ns = netns, bridge, "bridge up");
        Ok(())
    }

    fn bridge_attach(&self, netns: &str, bridge: &str, iface: &str) -> Result<()> {
        self.ip(Some(netns), &["link", "set", iface, "master", bridge])
            .with_context(|| format!("attach {iface} to {bridge} in '{netns}'"))
    }

    fn addr_add(&self, netns: &str, iface: &str, cidr: &str) -> Result<()> {
        self.ip(Some(netns), &["addr", "add", cidr, "dev", iface])
            .with_context(|| format!("assign {cidr} to {iface} in '{netns}'"))
    }

    fn shape(&self, netns: &str, iface: &str, shaping: &Shaping) -> Result<()> {
        if shaping.is_empty() {
            return Ok(());
        }
        let tc = shaping.tc_args(iface);
        let mut full = vec!["ip", "netns", "exec", netns];
        full.extend(tc.iter().map(String::as_str));
        self.privilege
            .run_checked(&full)
            .with_context(|| format!("shape {iface} in '{netns}'"))?;
        debug!(ns = netns, iface, args = ?shaping.netem_args(), "applied netem");
        Ok(())
    }

    fn command_in(&self, netns: &str, program: &str) -> Command {
        let mut cmd = self.privilege.command("ip");
        cmd.args(["netns", "exec", netns, program]);
        cmd
    }
}
