//! Shared utilities for integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use netkit::{HostCheck, IpBackend, NetBackend, scratch_prefix};
use routelab::LabConfig;
use routelab::supervisor::SupervisorConfig;

/// Returns `true` if tests should be skipped (prints the reason to stderr).
/// Use at the top of every test.
pub fn skip_without_deps() -> bool {
    skip_without(&[])
}

/// Like `skip_without_deps` but also requires the given binaries in PATH.
pub fn skip_without(binaries: &[&str]) -> bool {
    let host = HostCheck::inspect(binaries);
    if !host.is_ready() {
        eprintln!("Skipping: {host}");
        return true;
    }
    false
}

pub fn backend() -> Arc<dyn NetBackend> {
    Arc::new(IpBackend::detect())
}

/// Lab rooted at `base` with a namespace prefix no other test uses.
pub fn lab_config(base: &Path) -> LabConfig {
    LabConfig {
        base_dir: base.to_path_buf(),
        prefix: scratch_prefix("ri"),
        supervisor: SupervisorConfig {
            startup_probe: Duration::from_millis(200),
            launch_timeout: Duration::from_secs(5),
            grace_period: Duration::from_secs(1),
            ..SupervisorConfig::default()
        },
        reconcile_interval: Duration::from_millis(200),
        ..LabConfig::default()
    }
}

/// Write a one-line config into `<base>/conf/<node>/`.
pub fn write_router_config(base: &Path, node: &str) {
    let dir = base.join("conf").join(node);
    std::fs::create_dir_all(&dir).expect("create conf dir");
    std::fs::write(dir.join("bgpd.conf"), format!("hostname {node}\n")).expect("write conf");
}

/// Host namespaces whose name starts with `prefix`.
pub fn leftover_namespaces(prefix: &str) -> Vec<String> {
    IpBackend::detect()
        .netns_list()
        .expect("list namespaces")
        .into_iter()
        .filter(|ns| ns.starts_with(prefix))
        .collect()
}

/// Python one-liner that accepts TCP connections on the console port, a
/// stand-in for a routing daemon's vty.
pub fn console_stub() -> Vec<String> {
    vec![
        "-c".into(),
        "import socket, time\n\
         s = socket.socket()\n\
         s.setsockopt(socket.SOL_SOCKET, socket.SO_REUSEADDR, 1)\n\
         s.bind(('127.0.0.1', {console_port}))\n\
         s.listen(8)\n\
         print('{node} listening', flush=True)\n\
         time.sleep(600)"
            .into(),
    ]
}

/// Run `program args...` inside `node` and report success.
pub fn run_in(env: &routelab::ExecEnv, program: &str, args: &[&str]) -> bool {
    let out = env.command(program).args(args).output().expect("spawn");
    if !out.status.success() {
        eprintln!(
            "{program} in {} failed:\n{}{}",
            env.node(),
            String::from_utf8_lossy(&out.stdout),
            String::from_utf8_lossy(&out.stderr)
        );
    }
    out.status.success()
}
