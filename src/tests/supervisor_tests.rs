use std::fs;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use crate::context::{ContextId, ContextKind, ContextRegistry};
use crate::daemon::{DaemonSpec, ExecSpec};
use crate::error::Error;
use crate::naming::{InstanceId, NameAllocator};
use crate::node_state::NodeState;
use crate::supervisor::{ProcessSupervisor, StopOutcome, release_pid_file};
use crate::test_helpers::{
    MemoryBackend, STUBBORN_DAEMON, dead_pid, shell_daemon, test_config, write_router_config,
};
use crate::utils::{pid_alive, read_pid_file};

struct Fixture {
    _dir: tempfile::TempDir,
    contexts: Arc<ContextRegistry>,
    supervisor: ProcessSupervisor,
    node_state: NodeState,
    ctx: ContextId,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config(dir.path());
    let backend = MemoryBackend::new();
    let names = Arc::new(NameAllocator::new(
        InstanceId::random(),
        "rlt-",
        dir.path().join("run"),
    ));
    let contexts = Arc::new(ContextRegistry::new(Arc::new(backend), names));
    let ctx = contexts.create("r1", ContextKind::Node).unwrap();
    let supervisor = ProcessSupervisor::new(Arc::clone(&contexts), config.supervisor);
    let node_state = NodeState::new(dir.path(), 0o755, None);
    write_router_config(dir.path(), "r1");
    Fixture {
        _dir: dir,
        contexts,
        supervisor,
        node_state,
        ctx,
    }
}

fn exec(f: &Fixture, daemon: &DaemonSpec) -> ExecSpec {
    let paths = f.node_state.ensure("r1", None).unwrap();
    daemon.render("r1", &paths, None)
}

fn sleeper() -> DaemonSpec {
    DaemonSpec::custom("sleep", vec!["30".into()], 2605)
}

#[test]
fn test_launch_writes_pid_and_stops() {
    let f = fixture();
    let spec = exec(&f, &sleeper());
    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();

    let pid = handle.pid();
    assert_eq!(read_pid_file(&spec.pid_path), Some(pid));
    assert!(f.supervisor.is_alive(&mut handle));
    assert_eq!(handle.console().netns, "rlt-r1");
    assert_eq!(handle.console().port, 2605);

    assert_eq!(f.supervisor.stop(&mut handle).unwrap(), StopOutcome::Graceful);
    assert!(!spec.pid_path.exists());
    assert!(!pid_alive(pid));

    // Stopping again finds it gone.
    assert_eq!(
        f.supervisor.stop(&mut handle).unwrap(),
        StopOutcome::AlreadyExited
    );
}

#[test]
fn test_missing_binary() {
    let f = fixture();
    let spec = exec(&f, &DaemonSpec::custom("/nonexistent/zebra", Vec::new(), 2601));
    let err = f.supervisor.launch("r1", f.ctx, &spec).unwrap_err();
    assert!(matches!(err, Error::LaunchFailed { ref reason, .. } if reason.contains("not found")));
    assert!(!spec.pid_path.exists());
}

#[test]
fn test_missing_context() {
    let f = fixture();
    let spec = exec(&f, &sleeper());
    f.contexts.destroy(f.ctx).unwrap();
    let err = f.supervisor.launch("r1", f.ctx, &spec).unwrap_err();
    assert!(matches!(err, Error::LaunchFailed { .. }));
}

#[test]
fn test_early_exit_reports_log() {
    let f = fixture();
    let spec = exec(&f, &shell_daemon("echo 'bgpd: bad config line 3' >&2; exit 1"));
    let err = f.supervisor.launch("r1", f.ctx, &spec).unwrap_err();
    match err {
        Error::LaunchFailed { node, reason } => {
            assert_eq!(node, "r1");
            assert!(reason.contains("bad config line 3"), "{reason}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!spec.pid_path.exists());
}

#[test]
fn test_stale_pid_file_replaced() {
    let f = fixture();
    let spec = exec(&f, &sleeper());
    fs::write(&spec.pid_path, format!("{}\n", dead_pid())).unwrap();

    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();
    assert_eq!(read_pid_file(&spec.pid_path), Some(handle.pid()));
    f.supervisor.stop(&mut handle).unwrap();
}

#[test]
fn test_live_daemon_already_running() {
    let f = fixture();
    let spec = exec(&f, &sleeper());
    let mut other = Command::new("sleep").arg("30").spawn().unwrap();
    fs::write(&spec.pid_path, format!("{}\n", other.id())).unwrap();

    let err = f.supervisor.launch("r1", f.ctx, &spec).unwrap_err();
    assert!(matches!(err, Error::AlreadyRunning { pid, .. } if pid == other.id()));
    // The pid file is left for its owner.
    assert!(spec.pid_path.exists());

    other.kill().unwrap();
    other.wait().unwrap();
}

#[test]
fn test_live_unrelated_pid_ignored() {
    let f = fixture();
    let spec = exec(&f, &sleeper());
    // Our own pid is alive but not a sleep process.
    fs::write(&spec.pid_path, format!("{}\n", std::process::id())).unwrap();

    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();
    assert_ne!(handle.pid(), std::process::id());
    f.supervisor.stop(&mut handle).unwrap();
}

#[test]
fn test_stubborn_daemon_killed() {
    let f = fixture();
    let spec = exec(&f, &shell_daemon(STUBBORN_DAEMON));
    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();
    let pid = handle.pid();

    let err = f.supervisor.stop(&mut handle).unwrap_err();
    assert!(matches!(err, Error::StopTimeout { .. }));
    assert!(!err.is_fatal());
    assert!(!spec.pid_path.exists());
    assert!(!pid_alive(pid));
}

#[test]
fn test_log_captures_output_and_truncates() {
    let f = fixture();
    let spec = exec(&f, &shell_daemon("echo started {node}; exec sleep 30"));

    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();
    f.supervisor.stop(&mut handle).unwrap();
    let log = fs::read_to_string(&spec.log_path).unwrap();
    assert_eq!(log.trim(), "started r1");

    fs::write(&spec.log_path, "old run\nold run\n").unwrap();
    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();
    f.supervisor.stop(&mut handle).unwrap();
    let log = fs::read_to_string(&spec.log_path).unwrap();
    assert!(!log.contains("old run"));
    assert!(log.contains("started r1"));
}

#[test]
fn test_uptime_and_exit_status() {
    let f = fixture();
    let spec = exec(&f, &shell_daemon("sleep 0.3; exit 7"));
    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();
    assert!(handle.uptime() >= Duration::from_millis(100));

    assert!(handle.exit_status().is_none());

    std::thread::sleep(Duration::from_millis(600));
    assert!(!f.supervisor.is_alive(&mut handle));
    let status = handle.exit_status().expect("exited");
    assert_eq!(status.code(), Some(7));
}

#[test]
fn test_pid_file_kept_while_running() {
    let f = fixture();
    let spec = exec(&f, &sleeper());
    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();

    release_pid_file(&mut handle).unwrap();
    assert_eq!(read_pid_file(&spec.pid_path), Some(handle.pid()));

    f.supervisor.stop(&mut handle).unwrap();
    assert!(!spec.pid_path.exists());
}

#[test]
fn test_relaunch_after_unstopped_exit() {
    let f = fixture();
    let spec = exec(&f, &sleeper());
    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();
    let first = handle.pid();

    // SAFETY: signals the process group created for this child
    unsafe { libc::kill(-(first as libc::pid_t), libc::SIGKILL) };
    for _ in 0..100 {
        if !f.supervisor.is_alive(&mut handle) {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert!(!f.supervisor.is_alive(&mut handle));
    drop(handle);
    assert_eq!(read_pid_file(&spec.pid_path), Some(first));

    let mut handle = f.supervisor.launch("r1", f.ctx, &spec).unwrap();
    assert_ne!(handle.pid(), first);
    assert_eq!(read_pid_file(&spec.pid_path), Some(handle.pid()));
    assert_eq!(f.supervisor.stop(&mut handle).unwrap(), StopOutcome::Graceful);
}
