use std::sync::Arc;

use netkit::NetBackend;

use crate::context::{ContextId, ContextKind, ContextRegistry};
use crate::error::Error;
use crate::link::{Endpoint, LinkRegistry};
use crate::naming::{InstanceId, NameAllocator};
use crate::test_helpers::{MemoryBackend, files_with_ext};

struct Fixture {
    _dir: tempfile::TempDir,
    backend: MemoryBackend,
    contexts: Arc<ContextRegistry>,
    links: LinkRegistry,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let backend = MemoryBackend::new();
    let names = Arc::new(NameAllocator::new(
        InstanceId::random(),
        "rlt-",
        dir.path().join("run"),
    ));
    let contexts = Arc::new(ContextRegistry::new(
        Arc::new(backend.clone()),
        Arc::clone(&names),
    ));
    let links = LinkRegistry::new(Arc::new(backend.clone()), Arc::clone(&contexts), names);
    Fixture {
        _dir: dir,
        backend,
        contexts,
        links,
    }
}

fn node(f: &Fixture, name: &str) -> ContextId {
    f.contexts.create(name, ContextKind::Node).unwrap()
}

#[test]
fn test_connect_and_disconnect() {
    let f = fixture();
    let a = node(&f, "a");
    let b = node(&f, "b");

    let id = f
        .links
        .connect(Endpoint::new(a, "eth0"), Endpoint::new(b, "eth3"))
        .unwrap();
    assert_eq!(f.links.count(), 1);
    assert_eq!(
        f.backend.peer_of("rlt-a", "eth0"),
        Some((Some("rlt-b".to_string()), "eth3".to_string()))
    );
    assert_eq!(f.contexts.interfaces(a), vec!["eth0"]);
    assert_eq!(f.contexts.interfaces(b), vec!["eth3"]);

    let link = f.links.get(id).unwrap();
    assert_eq!(link.a, Endpoint::new(a, "eth0"));

    f.links.disconnect(id).unwrap();
    assert_eq!(f.links.count(), 0);
    assert_eq!(f.backend.veth_end_count(), 0);
    assert!(f.contexts.interfaces(a).is_empty());
    assert!(f.contexts.interfaces(b).is_empty());
}

#[test]
fn test_host_endpoint() {
    let f = fixture();
    let a = node(&f, "a");
    f.links
        .connect(Endpoint::new(a, "eth0"), Endpoint::host("rlhost0"))
        .unwrap();
    assert_eq!(
        f.backend.peer_of("rlt-a", "eth0"),
        Some((None, "rlhost0".to_string()))
    );
}

#[test]
fn test_busy_endpoint_rejected() {
    let f = fixture();
    let a = node(&f, "a");
    let b = node(&f, "b");
    let c = node(&f, "c");
    f.links
        .connect(Endpoint::new(a, "eth0"), Endpoint::new(b, "eth0"))
        .unwrap();
    let before = f.backend.op_count();

    let err = f
        .links
        .connect(Endpoint::new(c, "eth0"), Endpoint::new(a, "eth0"))
        .unwrap_err();
    assert!(matches!(err, Error::EndpointBusy { .. }));
    assert_eq!(f.backend.op_count(), before);
    assert_eq!(f.links.count(), 1);

    // Both ends the same.
    let err = f
        .links
        .connect(Endpoint::new(c, "eth1"), Endpoint::new(c, "eth1"))
        .unwrap_err();
    assert!(matches!(err, Error::EndpointBusy { .. }));
}

#[test]
fn test_disconnect_unknown_link() {
    let f = fixture();
    let a = node(&f, "a");
    let b = node(&f, "b");
    let id = f
        .links
        .connect(Endpoint::new(a, "eth0"), Endpoint::new(b, "eth0"))
        .unwrap();
    f.links.disconnect(id).unwrap();
    assert!(matches!(f.links.disconnect(id), Err(Error::NotFound(_))));
}

#[test]
fn test_disconnect_after_context_destroyed() {
    let f = fixture();
    let a = node(&f, "a");
    let b = node(&f, "b");
    let id = f
        .links
        .connect(Endpoint::new(a, "eth0"), Endpoint::new(b, "eth0"))
        .unwrap();

    f.contexts.destroy(b).unwrap();
    // The pair vanished with b's namespace.
    assert_eq!(f.backend.veth_end_count(), 0);
    f.links.disconnect(id).unwrap();
    assert_eq!(f.links.count(), 0);

    f.contexts.destroy(a).unwrap();
    f.links.disconnect(id).unwrap_err();
}

#[test]
fn test_failed_connect_unwinds() {
    let f = fixture();
    let a = node(&f, "a");
    let b = node(&f, "b");
    f.backend
        .fail_on("link_move", "rlt-b", "RTNETLINK answers: Invalid argument");

    let err = f
        .links
        .connect(Endpoint::new(a, "eth0"), Endpoint::new(b, "eth0"))
        .unwrap_err();
    assert!(matches!(err, Error::Host { .. }));
    assert_eq!(f.backend.veth_end_count(), 0);
    assert!(f.contexts.interfaces(a).is_empty());
    assert_eq!(f.links.count(), 0);

    // Endpoints are free again.
    f.backend.clear_failures();
    f.links
        .connect(Endpoint::new(a, "eth0"), Endpoint::new(b, "eth0"))
        .unwrap();
    assert_eq!(f.backend.veth_end_count(), 2);
}

#[test]
fn test_failed_veth_add_leaves_nothing() {
    let f = fixture();
    let a = node(&f, "a");
    let b = node(&f, "b");
    f.backend.fail_on("veth_add", "v", "RTNETLINK answers: No buffer space available");

    let err = f
        .links
        .connect(Endpoint::new(a, "eth0"), Endpoint::new(b, "eth0"))
        .unwrap_err();
    assert!(matches!(err, Error::ResourceExhausted { .. }));
    assert_eq!(f.backend.veth_end_count(), 0);
}

#[test]
fn test_interface_attached_once() {
    let f = fixture();
    let a = node(&f, "a");
    let b = node(&f, "b");
    f.backend.veth_add("vtest0a", "vtest0b").unwrap();

    f.contexts.attach_interface(a, "vtest0a", "eth0").unwrap();
    let err = f
        .contexts
        .attach_interface(b, "vtest0a", "eth0")
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyAttached { ref owner, .. } if owner == "a"));

    // Same in-context name twice.
    let err = f
        .contexts
        .attach_interface(a, "vtest0b", "eth0")
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyAttached { .. }));
}

#[test]
fn test_detached_host_name_reusable() {
    let f = fixture();
    let a = node(&f, "a");
    let b = node(&f, "b");
    f.backend.veth_add("vtest0a", "vtest0b").unwrap();
    f.contexts.attach_interface(a, "vtest0a", "eth0").unwrap();

    assert!(f.contexts.detach_interface(a, "eth0"));
    f.backend.link_del(Some("rlt-a"), "eth0").unwrap();

    f.backend.veth_add("vtest0a", "vtest0b").unwrap();
    f.contexts.attach_interface(b, "vtest0a", "eth0").unwrap();
    assert_eq!(f.contexts.interfaces(b), vec!["eth0"]);
    assert!(f.contexts.interfaces(a).is_empty());
}

#[test]
fn test_tcp_reachability_in_context() {
    let f = fixture();
    let a = node(&f, "a");
    let env = f.contexts.enter(a).unwrap();

    // The test backend's namespaces are not real, so this goes through the
    // command path, which runs on the host.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    assert!(env.probe_tcp(port, std::time::Duration::from_secs(2)));

    drop(listener);
    assert!(!env.probe_tcp(port, std::time::Duration::from_millis(500)));
}

#[test]
fn test_destroy_twice() {
    let f = fixture();
    let a = node(&f, "a");
    f.contexts.destroy(a).unwrap();
    assert!(matches!(f.contexts.destroy(a), Err(Error::NotFound(_))));
    assert_eq!(f.backend.namespace_count(), 0);
}

#[test]
fn test_duplicate_node_context() {
    let f = fixture();
    node(&f, "a");
    let err = f.contexts.create("a", ContextKind::Node).unwrap_err();
    assert!(matches!(err, Error::NameCollision { .. }));
    assert_eq!(f.backend.namespace_count(), 1);
}

#[test]
fn test_switch_context_has_bridge() {
    let f = fixture();
    let s = f.contexts.create("s1", ContextKind::Switch).unwrap();
    let h = node(&f, "h1");
    assert!(f.backend.has_bridge("rlt-s1", "br0"));

    f.links
        .connect(Endpoint::new(h, "eth0"), Endpoint::new(s, "eth1"))
        .unwrap();
    f.contexts.add_switch_port(s, "eth1").unwrap();
    assert_eq!(f.backend.master_of("rlt-s1", "eth1").as_deref(), Some("br0"));

    // Hosts have no bridge.
    assert!(f.contexts.add_switch_port(h, "eth0").is_err());
}

#[test]
fn test_failed_switch_cleanup_errors_do_not_mask_cause() {
    let f = fixture();
    f.backend
        .fail_on("bridge_add", "rlt-s1", "RTNETLINK answers: Operation not supported");
    f.backend.fail_on("netns_del", "rlt-s1", "Device or resource busy");

    let err = f.contexts.create("s1", ContextKind::Switch).unwrap_err();
    assert!(matches!(err, Error::Host { .. }), "{err}");
    assert!(err.to_string().contains("switch bridge"), "{err}");
    assert!(files_with_ext(&f._dir.path().join("run"), "owner").is_empty());
}
