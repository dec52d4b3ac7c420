use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::controller::{ControllerState, TopologyController, WatchMode};
use crate::error::{BuildPhase, Error};
use crate::reconcile::{NodeEvent, RestartPolicy};
use crate::session::ScriptSession;
use crate::test_helpers::{MemoryBackend, files_with_ext, shell_daemon, test_config, write_router_config};
use crate::topology::Topology;
use crate::utils::{pid_alive, read_pid_file};

fn controller(dir: &Path) -> (MemoryBackend, TopologyController) {
    let backend = MemoryBackend::new();
    let controller = TopologyController::new(Arc::new(backend.clone()), test_config(dir));
    (backend, controller)
}

fn routed(dir: &Path) -> Topology {
    write_router_config(dir, "r1");
    write_router_config(dir, "r2");
    let mut topo = Topology::single(2);
    topo.add_router("r1", None);
    topo.add_router("r2", None);
    topo.add_link("r1", "s1");
    topo.add_link("r1", "r2");
    topo
}

#[test]
fn test_build_and_teardown_transitions() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, mut controller) = controller(dir.path());
    assert_eq!(controller.state(), ControllerState::Idle);

    let view = controller.build(&routed(dir.path())).unwrap();
    assert_eq!(controller.state(), ControllerState::Running);
    assert_eq!(view.node_names().count(), 5);
    assert_eq!(controller.running().unwrap().running_daemons(), 2);

    let report = controller.teardown().unwrap();
    assert!(report.is_clean(), "{report}");
    assert_eq!(controller.state(), ControllerState::Idle);
    assert!(controller.running().is_none());
    assert_eq!(backend.namespace_count(), 0);
    assert_eq!(backend.veth_end_count(), 0);

    // Idle again: a fresh build works.
    controller.build(&routed(dir.path())).unwrap();
    assert_eq!(controller.state(), ControllerState::Running);
}

#[test]
fn test_invalid_state_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, mut controller) = controller(dir.path());

    assert!(matches!(
        controller.teardown(),
        Err(Error::InvalidState { op: "teardown", .. })
    ));
    assert!(matches!(
        controller.enter_namespace("h1"),
        Err(Error::InvalidState { .. })
    ));

    controller.build(&Topology::single(2)).unwrap();
    let err = controller.build(&Topology::single(2)).unwrap_err();
    assert!(matches!(err, Error::InvalidState { op: "build", ref state } if state == "running"));
    assert_eq!(controller.state(), ControllerState::Running);
}

#[test]
fn test_failed_build_returns_to_idle() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, mut controller) = controller(dir.path());
    backend.fail_on("bridge_add", "rlt-s1", "RTNETLINK answers: Operation not supported");

    let err = controller.build(&Topology::single(3)).unwrap_err();
    assert!(matches!(
        err,
        Error::Build {
            phase: BuildPhase::Contexts,
            ..
        }
    ));
    assert_eq!(controller.state(), ControllerState::Idle);
    assert!(controller.view().is_none());
    assert_eq!(backend.namespace_count(), 0);

    backend.clear_failures();
    controller.build(&Topology::single(3)).unwrap();
    assert_eq!(controller.state(), ControllerState::Running);
}

#[test]
fn test_enter_namespace() {
    let dir = tempfile::tempdir().unwrap();
    let (_backend, mut controller) = controller(dir.path());
    controller.build(&Topology::single(2)).unwrap();

    let env = controller.enter_namespace("h1").unwrap();
    assert_eq!(env.node(), "h1");
    assert_eq!(env.netns(), "rlt-h1");
    let out = env.command("echo").arg("inside").output().unwrap();
    assert_eq!(String::from_utf8_lossy(&out.stdout).trim(), "inside");

    assert!(matches!(
        controller.enter_namespace("h9"),
        Err(Error::NotFound(_))
    ));
}

#[test]
fn test_drop_tears_down() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, mut controller) = controller(dir.path());
    controller.build(&routed(dir.path())).unwrap();
    drop(controller);
    assert_eq!(backend.namespace_count(), 0);
    assert!(files_with_ext(&dir.path().join("run"), "pid").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_script_then_teardown() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, mut controller) = controller(dir.path());
    let topo = routed(dir.path());
    let mut session = ScriptSession::new(["nodes", "exec h1 echo ok", "quit"]);

    let report = controller
        .run(&topo, &mut session, WatchMode::TeardownOnExit)
        .await
        .unwrap()
        .expect("torn down");
    assert!(report.is_clean(), "{report}");

    assert_eq!(session.transcript().len(), 3);
    assert_eq!(session.transcript()[1].1, "ok");
    assert_eq!(controller.state(), ControllerState::Idle);
    assert_eq!(backend.namespace_count(), 0);
    assert_eq!(backend.veth_end_count(), 0);
    assert!(files_with_ext(&dir.path().join("run"), "owner").is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_keep_running() {
    let dir = tempfile::tempdir().unwrap();
    let (backend, mut controller) = controller(dir.path());
    let mut session = ScriptSession::new(["nodes"]);

    let report = controller
        .run(&Topology::single(2), &mut session, WatchMode::KeepRunning)
        .await
        .unwrap();
    assert!(report.is_none());
    assert_eq!(controller.state(), ControllerState::Running);
    assert_eq!(backend.namespace_count(), 3);

    tokio::task::block_in_place(|| controller.teardown()).unwrap();
    assert_eq!(backend.namespace_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_observer_reports_exit() {
    let dir = tempfile::tempdir().unwrap();
    write_router_config(dir.path(), "r1");
    let backend = MemoryBackend::new();
    let mut config = test_config(dir.path());
    config.daemon = shell_daemon("sleep 0.3; exit 2");
    let mut controller = TopologyController::new(Arc::new(backend), config);

    let mut topo = Topology::new();
    topo.add_router("r1", None);
    tokio::task::block_in_place(|| controller.build(&topo)).unwrap();
    let mut events = controller.start_observer().unwrap();

    let event = tokio::time::timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("event in time")
        .expect("channel open");
    assert_eq!(
        event,
        NodeEvent::Exited {
            node: "r1".into(),
            code: Some(2)
        }
    );
    // The topology itself stays up.
    assert_eq!(controller.state(), ControllerState::Running);

    tokio::task::block_in_place(|| controller.teardown()).unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_teardown_waits_for_pending_restart() {
    let dir = tempfile::tempdir().unwrap();
    write_router_config(dir.path(), "r1");
    let mut config = test_config(dir.path());
    // First run exits after 0.8s; the relaunch records its pid and stays up.
    config.daemon = shell_daemon(
        "test -e {run_dir}/{node}.once && { echo $$ > {run_dir}/{node}.second; exec sleep 30; }; \
         touch {run_dir}/{node}.once; sleep 0.8; exit 3",
    );
    config.supervisor.startup_probe = Duration::from_millis(600);
    config.restart = RestartPolicy::OnFailure {
        max_restarts: 3,
        base_delay: Duration::from_millis(10),
    };
    let backend = MemoryBackend::new();
    let mut controller = TopologyController::new(Arc::new(backend.clone()), config);

    let mut topo = Topology::new();
    topo.add_router("r1", None);
    tokio::task::block_in_place(|| controller.build(&topo)).unwrap();
    let _events = controller.start_observer().unwrap();

    // Wait until the relaunch is inside its startup window.
    let marker = dir.path().join("run").join("r1.second");
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let relaunched = loop {
        if let Some(pid) = read_pid_file(&marker) {
            break pid;
        }
        assert!(tokio::time::Instant::now() < deadline, "no relaunch");
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    let report = tokio::task::block_in_place(|| controller.teardown()).unwrap();
    assert!(report.is_clean(), "{report}");
    assert!(!pid_alive(relaunched), "relaunched daemon outlived teardown");
    assert_eq!(backend.namespace_count(), 0);
    assert!(files_with_ext(&dir.path().join("run"), "pid").is_empty());
}
