//! Isolated network execution contexts.
//!
//! Each node owns exactly one network namespace. The [`ContextRegistry`]
//! creates and destroys them, records which interfaces live where, and hands
//! out [`ExecEnv`]s for running things inside a context.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::fs::File;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use netkit::{NetBackend, Shaping};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::naming::{ClaimOutcome, NameAllocator};

/// Bridge device that turns a switch context into a learning switch.
pub const SWITCH_BRIDGE: &str = "br0";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u32);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextKind {
    /// Routed namespace for a host or router.
    Node,
    /// Multi-port namespace whose ports are bridged together.
    Switch,
}

/// An interface that has been moved into a context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterfaceHandle {
    pub context: ContextId,
    pub name: String,
}

#[derive(Debug)]
struct ContextEntry {
    node: String,
    netns: String,
    kind: ContextKind,
    interfaces: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u32,
    contexts: BTreeMap<ContextId, ContextEntry>,
    /// Host-side interface name -> context it was moved into, and its name
    /// there.
    attached: HashMap<String, (ContextId, String)>,
}

#[derive(Debug)]
pub struct ContextRegistry {
    backend: Arc<dyn NetBackend>,
    names: Arc<NameAllocator>,
    inner: Mutex<Inner>,
}

impl ContextRegistry {
    pub fn new(backend: Arc<dyn NetBackend>, names: Arc<NameAllocator>) -> Self {
        Self {
            backend,
            names,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Allocate a fresh namespace for `node`.
    pub fn create(&self, node: &str, kind: ContextKind) -> Result<ContextId> {
        let netns = self.names.netns_name(node);
        if self.lock().contexts.values().any(|c| c.node == node) {
            return Err(Error::NameCollision {
                name: netns,
                owner: Some(format!("instance {}", self.names.instance())),
            });
        }

        let exists = self
            .backend
            .netns_exists(&netns)
            .map_err(|e| Error::from_host("namespace lookup", &netns, e))?;
        let outcome = self.names.claim(&netns, exists)?;

        if let Err(e) = self.allocate(&netns, kind, exists, outcome) {
            if let Err(release) = self.names.release(&netns) {
                warn!(ns = %netns, "failed to release name claim: {release}");
            }
            return Err(e);
        }

        let mut inner = self.lock();
        let id = ContextId(inner.next_id);
        inner.next_id += 1;
        inner.contexts.insert(
            id,
            ContextEntry {
                node: node.to_string(),
                netns: netns.clone(),
                kind,
                interfaces: BTreeSet::new(),
            },
        );
        info!(node, ns = %netns, ?kind, %id, "context created");
        Ok(id)
    }

    fn allocate(&self, netns: &str, kind: ContextKind, exists: bool, outcome: ClaimOutcome) -> Result<()> {
        if exists && matches!(outcome, ClaimOutcome::Reclaimed(_)) {
            self.backend
                .netns_del(netns)
                .map_err(|e| Error::from_host("stale namespace", netns, e))?;
            debug!(ns = netns, "removed stale namespace");
        }

        self.backend
            .netns_add(netns)
            .map_err(|e| Error::from_host("namespace", netns, e))?;

        if kind == ContextKind::Switch
            && let Err(e) = self.backend.bridge_add(netns, SWITCH_BRIDGE)
        {
            if let Err(del) = self.backend.netns_del(netns) {
                warn!(ns = netns, "failed to remove namespace after bridge error: {del:#}");
            }
            return Err(Error::from_host("switch bridge", netns, e));
        }
        Ok(())
    }

    /// Release the namespace. Any interfaces still inside go with it.
    pub fn destroy(&self, id: ContextId) -> Result<()> {
        let entry = {
            let mut inner = self.lock();
            let entry = inner
                .contexts
                .remove(&id)
                .ok_or_else(|| Error::NotFound(format!("context {id}")))?;
            inner.attached.retain(|_, (ctx, _)| *ctx != id);
            entry
        };

        if let Err(e) = self.backend.netns_del(&entry.netns) {
            let gone = !self.backend.netns_exists(&entry.netns).unwrap_or(true);
            if !gone {
                return Err(Error::from_host("namespace delete", &entry.netns, e));
            }
            debug!(ns = %entry.netns, "namespace already gone");
        }
        self.names.release(&entry.netns)?;
        info!(node = %entry.node, ns = %entry.netns, "context destroyed");
        Ok(())
    }

    /// Move the host interface `host_iface` into the context as `name`.
    pub fn attach_interface(&self, id: ContextId, host_iface: &str, name: &str) -> Result<InterfaceHandle> {
        let netns = {
            let mut inner = self.lock();
            if let Some((owner, _)) = inner.attached.get(host_iface).cloned() {
                let owner = inner
                    .contexts
                    .get(&owner)
                    .map(|c| c.node.clone())
                    .unwrap_or_else(|| owner.to_string());
                return Err(Error::AlreadyAttached {
                    iface: host_iface.to_string(),
                    owner,
                });
            }
            let entry = inner
                .contexts
                .get_mut(&id)
                .ok_or_else(|| Error::NotFound(format!("context {id}")))?;
            if !entry.interfaces.insert(name.to_string()) {
                return Err(Error::AlreadyAttached {
                    iface: name.to_string(),
                    owner: entry.node.clone(),
                });
            }
            let netns = entry.netns.clone();
            inner
                .attached
                .insert(host_iface.to_string(), (id, name.to_string()));
            netns
        };

        if let Err(e) = self.backend.link_move(host_iface, &netns, name) {
            let mut inner = self.lock();
            inner.attached.remove(host_iface);
            if let Some(entry) = inner.contexts.get_mut(&id) {
                entry.interfaces.remove(name);
            }
            return Err(Error::from_host("interface", name, e));
        }

        debug!(ns = %netns, from = host_iface, iface = name, "interface attached");
        Ok(InterfaceHandle {
            context: id,
            name: name.to_string(),
        })
    }

    /// Forget `name` in the context's interface set, freeing the host name
    /// it was attached from. Returns false when the context no longer exists.
    pub fn detach_interface(&self, id: ContextId, name: &str) -> bool {
        let mut inner = self.lock();
        inner
            .attached
            .retain(|_, (ctx, iface)| !(*ctx == id && iface == name));
        match inner.contexts.get_mut(&id) {
            Some(entry) => {
                entry.interfaces.remove(name);
                true
            }
            None => false,
        }
    }

    /// Enslave an attached interface to the switch bridge.
    pub fn add_switch_port(&self, id: ContextId, iface: &str) -> Result<()> {
        let (netns, kind) = self.with_entry(id, |e| (e.netns.clone(), e.kind))?;
        if kind != ContextKind::Switch {
            return Err(Error::Host {
                op: format!("switch port {iface}"),
                reason: format!("context {id} is not a switch"),
            });
        }
        self.backend
            .bridge_attach(&netns, SWITCH_BRIDGE, iface)
            .map_err(|e| Error::from_host("switch port", iface, e))
    }

    pub fn add_address(&self, id: ContextId, iface: &str, cidr: &str) -> Result<()> {
        let netns = self.netns_of(id)?;
        self.backend
            .addr_add(&netns, iface, cidr)
            .map_err(|e| Error::from_host("address", cidr, e))
    }

    pub fn shape(&self, id: ContextId, iface: &str, shaping: &Shaping) -> Result<()> {
        let netns = self.netns_of(id)?;
        self.backend
            .shape(&netns, iface, shaping)
            .map_err(|e| Error::from_host("link shaping", iface, e))
    }

    /// Execution environment inside the context.
    pub fn enter(&self, id: ContextId) -> Result<ExecEnv> {
        let (node, netns) = self.with_entry(id, |e| (e.node.clone(), e.netns.clone()))?;
        Ok(ExecEnv {
            node,
            netns,
            backend: Arc::clone(&self.backend),
        })
    }

    /// Namespace name, or `None` once destroyed.
    pub fn netns_name(&self, id: ContextId) -> Option<String> {
        self.lock().contexts.get(&id).map(|e| e.netns.clone())
    }

    pub fn lookup(&self, node: &str) -> Option<ContextId> {
        self.lock()
            .contexts
            .iter()
            .find(|(_, e)| e.node == node)
            .map(|(id, _)| *id)
    }

    pub fn interfaces(&self, id: ContextId) -> Vec<String> {
        self.lock()
            .contexts
            .get(&id)
            .map(|e| e.interfaces.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn ids(&self) -> Vec<ContextId> {
        self.lock().contexts.keys().copied().collect()
    }

    /// Live contexts.
    pub fn count(&self) -> usize {
        self.lock().contexts.len()
    }

    fn netns_of(&self, id: ContextId) -> Result<String> {
        self.netns_name(id)
            .ok_or_else(|| Error::NotFound(format!("context {id}")))
    }

    fn with_entry<T>(&self, id: ContextId, f: impl FnOnce(&ContextEntry) -> T) -> Result<T> {
        self.lock()
            .contexts
            .get(&id)
            .map(f)
            .ok_or_else(|| Error::NotFound(format!("context {id}")))
    }
}

/// A node's namespace as seen by an external shell or console client.
#[derive(Clone)]
pub struct ExecEnv {
    node: String,
    netns: String,
    backend: Arc<dyn NetBackend>,
}

impl fmt::Debug for ExecEnv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecEnv")
            .field("node", &self.node)
            .field("netns", &self.netns)
            .finish()
    }
}

impl ExecEnv {
    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn netns(&self) -> &str {
        &self.netns
    }

    /// Command that runs `program` inside the namespace.
    pub fn command(&self, program: &str) -> Command {
        self.backend.command_in(&self.netns, program)
    }

    pub fn netns_path(&self) -> PathBuf {
        self.backend.netns_path(&self.netns)
    }

    /// Run `f` on a short-lived thread that has joined the namespace with
    /// `setns(2)`. The error is about entering; `f`'s own result is passed
    /// through. Requires CAP_SYS_ADMIN.
    fn on_namespace_thread<T: Send>(&self, f: impl FnOnce() -> T + Send) -> io::Result<T> {
        let path = self.netns_path();
        std::thread::scope(|s| {
            s.spawn(move || {
                let ns = File::open(&path)?;
                // SAFETY: valid fd for a netns file; only this thread switches
                let ret = unsafe { libc::setns(ns.as_raw_fd(), libc::CLONE_NEWNET) };
                if ret != 0 {
                    return Err(io::Error::last_os_error());
                }
                Ok(f())
            })
            .join()
            .unwrap_or_else(|_| Err(io::Error::other("namespace thread panicked")))
        })
    }

    /// Connect to `127.0.0.1:port` from inside the namespace.
    ///
    /// The socket stays bound to the namespace after the helper thread
    /// exits. Needs CAP_SYS_ADMIN in this process.
    pub fn connect_tcp(&self, port: u16, timeout: Duration) -> io::Result<TcpStream> {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        self.on_namespace_thread(move || TcpStream::connect_timeout(&addr, timeout))?
    }

    /// True if something accepts TCP connections on `127.0.0.1:port` inside
    /// the namespace.
    ///
    /// Falls back to a connection attempt run through [`ExecEnv::command`] when this
    /// process cannot enter the namespace itself (running through sudo).
    pub fn probe_tcp(&self, port: u16, timeout: Duration) -> bool {
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match self.on_namespace_thread(move || TcpStream::connect_timeout(&addr, timeout).is_ok()) {
            Ok(up) => up,
            Err(e) => {
                debug!(ns = %self.netns, "cannot enter namespace ({e}), trying via command");
                self.connects_via_command(port, timeout)
            }
        }
    }

    fn connects_via_command(&self, port: u16, timeout: Duration) -> bool {
        let secs = format!("{:.3}", timeout.as_secs_f64().max(0.001));
        let port = port.to_string();
        self.command("timeout")
            .args([
                secs.as_str(),
                "bash",
                "-c",
                "exec 3<>\"/dev/tcp/127.0.0.1/$1\"",
                "bash",
                port.as_str(),
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok_and(|s| s.success())
    }
}
