//! Declarative topology description.
//!
//! A [`Topology`] is a list of nodes and undirected links between them. It can
//! be assembled programmatically (`add_host`, `add_switch`, `add_router`,
//! `add_link`), loaded from JSON, or taken from one of the presets.
//! [`Topology::plan`] validates it and resolves ports, interface names and
//! addresses without touching the host.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use netkit::Shaping;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest accepted node name.
pub const MAX_NODE_NAME: usize = 64;

/// Role of a node in the topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Legacy layer-2 learning switch.
    Switch,
    /// End host.
    Host,
    /// Software router running a supervised routing daemon.
    Router,
}

impl Role {
    /// First port number used when ports are assigned automatically.
    pub const fn port_base(self) -> u16 {
        match self {
            Role::Switch => 1,
            Role::Host | Role::Router => 0,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Switch => write!(f, "switch"),
            Role::Host => write!(f, "host"),
            Role::Router => write!(f, "router"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub name: String,
    pub role: Role,
    /// Router startup configuration directory. Defaults to `<base>/conf/<name>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_dir: Option<PathBuf>,
    /// Host address (CIDR) for the host's first interface.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    /// Console credential, handed to the console unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub console_credential: Option<String>,
}

impl NodeSpec {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            config_dir: None,
            ip: None,
            console_credential: None,
        }
    }
}

/// An undirected link between two nodes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub a: String,
    pub b: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_a: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_b: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr_a: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub addr_b: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_percent: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_kbit: Option<u64>,
}

impl LinkSpec {
    pub fn new(a: impl Into<String>, b: impl Into<String>) -> Self {
        Self {
            a: a.into(),
            b: b.into(),
            ..Default::default()
        }
    }

    pub fn ports(mut self, port_a: u16, port_b: u16) -> Self {
        self.port_a = Some(port_a);
        self.port_b = Some(port_b);
        self
    }

    pub fn addrs(mut self, addr_a: impl Into<String>, addr_b: impl Into<String>) -> Self {
        self.addr_a = Some(addr_a.into());
        self.addr_b = Some(addr_b.into());
        self
    }

    pub fn shaping(&self) -> Shaping {
        Shaping {
            delay_ms: self.delay_ms,
            jitter_ms: self.jitter_ms,
            loss_percent: self.loss_percent,
            rate_kbit: self.rate_kbit,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, spec: NodeSpec) -> String {
        let name = spec.name.clone();
        self.nodes.push(spec);
        name
    }

    pub fn add_host(&mut self, name: &str) -> String {
        self.add_node(NodeSpec::new(name, Role::Host))
    }

    pub fn add_switch(&mut self, name: &str) -> String {
        self.add_node(NodeSpec::new(name, Role::Switch))
    }

    /// Add a router. `config_dir: None` uses the default per-node location.
    pub fn add_router(&mut self, name: &str, config_dir: Option<PathBuf>) -> String {
        self.add_node(NodeSpec {
            config_dir,
            ..NodeSpec::new(name, Role::Router)
        })
    }

    pub fn add_link(&mut self, a: &str, b: &str) -> &mut LinkSpec {
        self.add_link_spec(LinkSpec::new(a, b))
    }

    pub fn add_link_spec(&mut self, spec: LinkSpec) -> &mut LinkSpec {
        self.links.push(spec);
        let last = self.links.len() - 1;
        &mut self.links[last]
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Node names with the given role, in natural order.
    pub fn names_with_role(&self, role: Role) -> Vec<String> {
        let mut names: Vec<String> = self
            .nodes
            .iter()
            .filter(|n| n.role == role)
            .map(|n| n.name.clone())
            .collect();
        names.sort_by(|a, b| natural_cmp(a, b));
        names
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::TopologyInvalid(format!("parse: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }

    // ---------------------------------------------------------------------
    // Presets
    // ---------------------------------------------------------------------

    /// Single switch `s1` connected to hosts `h1..=hk`.
    pub fn single(k: usize) -> Self {
        let mut topo = Self::new();
        let switch = topo.add_switch("s1");
        for h in 1..=k {
            let host = topo.add_host(&format!("h{h}"));
            topo.add_link(&host, &switch);
        }
        topo
    }

    /// Like [`Topology::single`], but the lowest-numbered host gets the
    /// highest-numbered switch port.
    pub fn single_reversed(k: usize) -> Self {
        let mut topo = Self::new();
        let switch = topo.add_switch("s1");
        for h in 1..=k {
            let host = topo.add_host(&format!("h{h}"));
            let port = u16::try_from(k - h + 1).unwrap_or(u16::MAX);
            topo.add_link_spec(LinkSpec::new(host, &switch).ports(0, port));
        }
        topo
    }

    /// `k` switches in a line, each with `n` hosts.
    pub fn linear(k: usize, n: usize) -> Self {
        let mut topo = Self::new();
        let mut last_switch: Option<String> = None;
        for i in 1..=k {
            let switch = topo.add_switch(&format!("s{i}"));
            for j in 1..=n {
                let host = if n == 1 {
                    format!("h{i}")
                } else {
                    format!("h{j}s{i}")
                };
                let host = topo.add_host(&host);
                topo.add_link(&host, &switch);
            }
            if let Some(prev) = &last_switch {
                topo.add_link(&switch, prev);
            }
            last_switch = Some(switch);
        }
        topo
    }

    /// Parse a preset description: `single:K`, `reversed:K` or `linear:K[,N]`.
    pub fn preset(desc: &str) -> Result<Self> {
        let (kind, args) = desc.split_once(':').unwrap_or((desc, ""));
        let nums: Vec<usize> = if args.is_empty() {
            Vec::new()
        } else {
            args.split(',')
                .map(|s| s.trim().parse::<usize>())
                .collect::<std::result::Result<_, _>>()
                .map_err(|e| Error::TopologyInvalid(format!("preset '{desc}': {e}")))?
        };
        let arg = |i: usize, default: usize| nums.get(i).copied().unwrap_or(default);
        match kind {
            "single" => Ok(Self::single(arg(0, 2))),
            "reversed" => Ok(Self::single_reversed(arg(0, 2))),
            "linear" => Ok(Self::linear(arg(0, 2), arg(1, 1))),
            other => Err(Error::TopologyInvalid(format!(
                "unknown preset '{other}': use single, reversed, or linear"
            ))),
        }
    }

    // ---------------------------------------------------------------------
    // Validation
    // ---------------------------------------------------------------------

    /// Validate the topology and resolve ports, interfaces and addresses.
    ///
    /// Pure: nothing on the host is touched.
    pub fn plan(&self) -> Result<TopologyPlan> {
        let mut seen = HashSet::new();
        for node in &self.nodes {
            validate_node_name(&node.name)?;
            if !seen.insert(node.name.as_str()) {
                return Err(Error::TopologyInvalid(format!(
                    "duplicate node name '{}'",
                    node.name
                )));
            }
            if node.config_dir.is_some() && node.role != Role::Router {
                return Err(Error::TopologyInvalid(format!(
                    "config_dir given for {} '{}'; only routers take one",
                    node.role, node.name
                )));
            }
            if let Some(ip) = &node.ip {
                validate_cidr(ip)?;
            }
        }

        let role_of = |name: &str| self.node(name).map(|n| n.role);
        let mut ports: BTreeMap<&str, BTreeSet<u16>> = BTreeMap::new();
        let mut planned = Vec::with_capacity(self.links.len());

        for (index, link) in self.links.iter().enumerate() {
            let (Some(role_a), Some(role_b)) = (role_of(&link.a), role_of(&link.b)) else {
                let missing = if role_of(&link.a).is_none() { &link.a } else { &link.b };
                return Err(Error::TopologyInvalid(format!(
                    "link {} <-> {} references unknown node '{missing}'",
                    link.a, link.b
                )));
            };
            if link.a == link.b {
                return Err(Error::TopologyInvalid(format!(
                    "link connects '{}' to itself",
                    link.a
                )));
            }
            for addr in [&link.addr_a, &link.addr_b].into_iter().flatten() {
                validate_cidr(addr)?;
            }

            let port_a = take_port(&mut ports, &link.a, role_a, link.port_a)?;
            let port_b = take_port(&mut ports, &link.b, role_b, link.port_b)?;

            planned.push(PlannedLink {
                index,
                a: PlannedEnd::new(&link.a, role_a, port_a, link.addr_a.clone()),
                b: PlannedEnd::new(&link.b, role_b, port_b, link.addr_b.clone()),
                shaping: link.shaping(),
            });
        }

        assign_host_addresses(&self.nodes, &mut planned);

        let mut nodes = self.nodes.clone();
        nodes.sort_by(|x, y| natural_cmp(&x.name, &y.name));

        Ok(TopologyPlan {
            nodes,
            links: planned,
        })
    }
}

/// Result of [`Topology::plan`]: a validated, fully resolved topology.
#[derive(Clone, Debug)]
pub struct TopologyPlan {
    /// Nodes in natural name order.
    pub nodes: Vec<NodeSpec>,
    /// Links in declaration order.
    pub links: Vec<PlannedLink>,
}

impl TopologyPlan {
    pub fn routers(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.iter().filter(|n| n.role == Role::Router)
    }

    pub fn node(&self, name: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.name == name)
    }
}

#[derive(Clone, Debug)]
pub struct PlannedLink {
    /// Position in the source topology's link list.
    pub index: usize,
    pub a: PlannedEnd,
    pub b: PlannedEnd,
    pub shaping: Shaping,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PlannedEnd {
    pub node: String,
    pub role: Role,
    pub port: u16,
    /// Interface name inside the node's namespace.
    pub iface: String,
    pub addr: Option<String>,
}

impl PlannedEnd {
    fn new(node: &str, role: Role, port: u16, addr: Option<String>) -> Self {
        Self {
            node: node.to_string(),
            role,
            port,
            iface: iface_name(port),
            addr,
        }
    }
}

/// Interface name for `port` inside a node's namespace.
pub fn iface_name(port: u16) -> String {
    format!("eth{port}")
}

fn take_port<'a>(
    ports: &mut BTreeMap<&'a str, BTreeSet<u16>>,
    node: &'a str,
    role: Role,
    explicit: Option<u16>,
) -> Result<u16> {
    let used = ports.entry(node).or_default();
    let port = match explicit {
        Some(p) => p,
        None => {
            // Next free port at or after `count + base`.
            let mut p = u16::try_from(used.len())
                .unwrap_or(u16::MAX)
                .saturating_add(role.port_base());
            while used.contains(&p) {
                p = p.checked_add(1).ok_or_else(|| {
                    Error::TopologyInvalid(format!("'{node}' ran out of ports"))
                })?;
            }
            p
        }
    };
    if !used.insert(port) {
        return Err(Error::TopologyInvalid(format!(
            "port {port} on '{node}' is used by more than one link"
        )));
    }
    Ok(port)
}

/// Give every host an address on its lowest-numbered interface unless one of
/// its link ends already carries one. Explicit `NodeSpec::ip` wins, otherwise
/// hosts are numbered from `10.0.0.1/8` in natural name order.
fn assign_host_addresses(nodes: &[NodeSpec], links: &mut [PlannedLink]) {
    let mut hosts: Vec<&NodeSpec> = nodes.iter().filter(|n| n.role == Role::Host).collect();
    hosts.sort_by(|x, y| natural_cmp(&x.name, &y.name));

    for (i, host) in hosts.iter().enumerate() {
        let ends: Vec<&PlannedEnd> = links
            .iter()
            .flat_map(|l| [&l.a, &l.b])
            .filter(|e| e.node == host.name)
            .collect();
        if ends.iter().any(|e| e.addr.is_some()) {
            continue;
        }
        let Some(first_port) = ends.iter().map(|e| e.port).min() else {
            continue;
        };
        let addr = host
            .ip
            .clone()
            .unwrap_or_else(|| default_host_ip(i as u32 + 1));
        if let Some(end) = links
            .iter_mut()
            .flat_map(|l| [&mut l.a, &mut l.b])
            .find(|e| e.node == host.name && e.port == first_port)
        {
            end.addr = Some(addr);
        }
    }
}

/// `n`-th address in `10.0.0.0/8`, as CIDR.
pub fn default_host_ip(n: u32) -> String {
    format!("10.{}.{}.{}/8", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff)
}

fn validate_node_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= MAX_NODE_NAME
        && !name.starts_with(['.', '-'])
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if !valid {
        return Err(Error::TopologyInvalid(format!(
            "invalid node name '{name}': use 1-{MAX_NODE_NAME} chars of [A-Za-z0-9_.-]"
        )));
    }
    Ok(())
}

fn validate_cidr(cidr: &str) -> Result<()> {
    let invalid = || Error::TopologyInvalid(format!("invalid address '{cidr}': expected ADDR/LEN"));
    let (addr, len) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let len: u8 = len.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if len > max {
        return Err(invalid());
    }
    Ok(())
}

/// Natural ordering: digit runs compare numerically, so `h2 < h10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        match (a.is_empty(), b.is_empty()) {
            (true, true) => return Ordering::Equal,
            (true, false) => return Ordering::Less,
            (false, true) => return Ordering::Greater,
            _ => {}
        }
        let (ca, ra) = split_chunk(a);
        let (cb, rb) = split_chunk(b);
        let ord = match (ca.parse::<u64>(), cb.parse::<u64>()) {
            (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| ca.len().cmp(&cb.len())),
            _ => ca.cmp(cb),
        };
        if ord != Ordering::Equal {
            return ord;
        }
        a = ra;
        b = rb;
    }
}

/// Split off the leading run of digits or non-digits.
fn split_chunk(s: &str) -> (&str, &str) {
    let digit = s.starts_with(|c: char| c.is_ascii_digit());
    let end = s
        .find(|c: char| c.is_ascii_digit() != digit)
        .unwrap_or(s.len());
    s.split_at(end)
}
