//! Virtual point-to-point links (veth pairs).

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use netkit::NetBackend;
use tracing::{debug, warn};

use crate::context::{ContextId, ContextRegistry};
use crate::error::{Error, Result};
use crate::naming::NameAllocator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u32);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "link#{}", self.0)
    }
}

/// One side of a link: an interface name, inside a context or (when
/// `context` is `None`) left in the host namespace.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub context: Option<ContextId>,
    pub iface: String,
}

impl Endpoint {
    pub fn new(context: ContextId, iface: impl Into<String>) -> Self {
        Self {
            context: Some(context),
            iface: iface.into(),
        }
    }

    pub fn host(iface: impl Into<String>) -> Self {
        Self {
            context: None,
            iface: iface.into(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.context {
            Some(ctx) => write!(f, "{ctx}/{}", self.iface),
            None => write!(f, "host/{}", self.iface),
        }
    }
}

/// An undirected wire. Carries nothing but its two endpoints.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VirtualLink {
    pub id: LinkId,
    pub a: Endpoint,
    pub b: Endpoint,
}

#[derive(Debug, Default)]
struct Inner {
    next_id: u32,
    links: BTreeMap<LinkId, VirtualLink>,
    busy: HashSet<Endpoint>,
}

#[derive(Debug)]
pub struct LinkRegistry {
    backend: Arc<dyn NetBackend>,
    contexts: Arc<ContextRegistry>,
    names: Arc<NameAllocator>,
    inner: Mutex<Inner>,
}

impl LinkRegistry {
    pub fn new(
        backend: Arc<dyn NetBackend>,
        contexts: Arc<ContextRegistry>,
        names: Arc<NameAllocator>,
    ) -> Self {
        Self {
            backend,
            contexts,
            names,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wire `a` to `b`. A half-built pair is removed before an error returns.
    pub fn connect(&self, a: Endpoint, b: Endpoint) -> Result<LinkId> {
        let id = {
            let mut inner = self.lock();
            for ep in [&a, &b] {
                if inner.busy.contains(ep) {
                    return Err(Error::EndpointBusy {
                        endpoint: ep.to_string(),
                    });
                }
            }
            if a == b {
                return Err(Error::EndpointBusy {
                    endpoint: a.to_string(),
                });
            }
            inner.busy.insert(a.clone());
            inner.busy.insert(b.clone());
            let id = LinkId(inner.next_id);
            inner.next_id += 1;
            id
        };

        if let Err(e) = self.wire(&a, &b) {
            let mut inner = self.lock();
            inner.busy.remove(&a);
            inner.busy.remove(&b);
            return Err(e);
        }

        debug!(%id, a = %a, b = %b, "link connected");
        self.lock().links.insert(id, VirtualLink { id, a, b });
        Ok(id)
    }

    fn wire(&self, a: &Endpoint, b: &Endpoint) -> Result<()> {
        let (host_a, host_b) = self.names.transient_pair();
        self.backend
            .veth_add(&host_a, &host_b)
            .map_err(|e| Error::from_host("veth pair", &host_a, e))?;

        // Where the `a` end currently lives, for unwinding.
        let mut a_at: (Option<String>, String) = (None, host_a.clone());
        let mut attached = Vec::new();

        let result: Result<()> = (|| {
            for (side, ep, host_name) in [(0, a, &host_a), (1, b, &host_b)] {
                let now_at = match ep.context {
                    Some(ctx) => {
                        self.contexts.attach_interface(ctx, host_name, &ep.iface)?;
                        attached.push((ctx, ep.iface.clone()));
                        self.contexts.netns_name(ctx)
                    }
                    None => {
                        self.backend
                            .link_rename(None, host_name, &ep.iface)
                            .map_err(|e| Error::from_host("interface", &ep.iface, e))?;
                        None
                    }
                };
                if side == 0 {
                    a_at = (now_at, ep.iface.clone());
                }
            }
            Ok(())
        })();

        if result.is_err() {
            // Deleting either end removes the pair.
            if let Err(e) = self.backend.link_del(a_at.0.as_deref(), &a_at.1) {
                warn!(iface = %a_at.1, "failed to remove half-built link: {e:#}");
            }
            for (ctx, iface) in attached {
                self.contexts.detach_interface(ctx, &iface);
            }
        }
        result
    }

    /// Remove the wire. Tolerates endpoints whose namespace is already gone.
    pub fn disconnect(&self, id: LinkId) -> Result<()> {
        let link = {
            let mut inner = self.lock();
            let link = inner
                .links
                .remove(&id)
                .ok_or_else(|| Error::NotFound(format!("{id}")))?;
            inner.busy.remove(&link.a);
            inner.busy.remove(&link.b);
            link
        };

        let mut result = Ok(());
        for ep in [&link.a, &link.b] {
            let netns = match ep.context {
                Some(ctx) => match self.contexts.netns_name(ctx) {
                    Some(ns) => Some(ns),
                    // Context destroyed: this end went with it.
                    None => continue,
                },
                None => None,
            };
            match self.backend.link_exists(netns.as_deref(), &ep.iface) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    result = Err(Error::from_host("link lookup", &ep.iface, e));
                    continue;
                }
            }
            match self.backend.link_del(netns.as_deref(), &ep.iface) {
                Ok(()) => {
                    result = Ok(());
                    break;
                }
                Err(e) => {
                    let still_there = self
                        .backend
                        .link_exists(netns.as_deref(), &ep.iface)
                        .unwrap_or(true);
                    if still_there {
                        result = Err(Error::from_host("link delete", &ep.iface, e));
                    }
                }
            }
        }

        for ep in [&link.a, &link.b] {
            if let Some(ctx) = ep.context {
                self.contexts.detach_interface(ctx, &ep.iface);
            }
        }

        if result.is_ok() {
            debug!(%id, "link disconnected");
        }
        result
    }

    pub fn get(&self, id: LinkId) -> Option<VirtualLink> {
        self.lock().links.get(&id).cloned()
    }

    pub fn links(&self) -> Vec<VirtualLink> {
        self.lock().links.values().cloned().collect()
    }

    pub fn count(&self) -> usize {
        self.lock().links.len()
    }
}
