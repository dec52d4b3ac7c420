use std::fs;
use std::os::unix::fs::PermissionsExt;

use crate::error::Error;
use crate::node_state::NodeState;
use crate::test_helpers::{dead_pid, write_router_config};

fn mode_of(path: &std::path::Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[test]
fn test_paths_layout() {
    let state = NodeState::new("/srv/lab", 0o755, None);
    let paths = state.paths("r1", None);
    assert_eq!(paths.config_dir, std::path::Path::new("/srv/lab/conf/r1"));
    assert_eq!(paths.log_path, std::path::Path::new("/srv/lab/log/r1.log"));
    assert_eq!(paths.pid_path, std::path::Path::new("/srv/lab/run/r1.pid"));

    let custom = state.paths("r1", Some(std::path::Path::new("/etc/quagga/r1")));
    assert_eq!(custom.config_dir, std::path::Path::new("/etc/quagga/r1"));
}

#[test]
fn test_ensure_creates_dirs_with_mode() {
    let dir = tempfile::tempdir().unwrap();
    write_router_config(dir.path(), "r1");
    let state = NodeState::new(dir.path(), 0o750, None);

    let paths = state.ensure("r1", None).unwrap();
    assert!(state.log_dir().is_dir());
    assert!(state.run_dir().is_dir());
    assert_eq!(mode_of(&state.log_dir()), 0o750);
    assert_eq!(mode_of(&state.run_dir()), 0o750);
    assert_eq!(paths.config_dir, dir.path().join("conf").join("r1"));

    // Idempotent.
    let again = state.ensure("r1", None).unwrap();
    assert_eq!(paths, again);
}

#[test]
fn test_missing_config_dir_not_created() {
    let dir = tempfile::tempdir().unwrap();
    let state = NodeState::new(dir.path(), 0o755, None);

    let err = state.ensure("r9", None).unwrap_err();
    match err {
        Error::ConfigMissing { node, path } => {
            assert_eq!(node, "r9");
            assert_eq!(path, dir.path().join("conf").join("r9"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dir.path().join("conf").exists());
    assert!(!state.run_dir().exists());
}

#[test]
fn test_empty_config_dir_rejected() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("conf").join("r1")).unwrap();
    let state = NodeState::new(dir.path(), 0o755, None);
    assert!(matches!(
        state.check_config("r1", None),
        Err(Error::ConfigMissing { .. })
    ));
}

#[test]
fn test_clean_keeps_config() {
    let dir = tempfile::tempdir().unwrap();
    let conf = write_router_config(dir.path(), "r1");
    let state = NodeState::new(dir.path(), 0o755, None);
    let paths = state.ensure("r1", None).unwrap();
    fs::write(&paths.log_path, "hello\n").unwrap();
    fs::write(&paths.pid_path, "1\n").unwrap();

    state.clean("r1").unwrap();
    assert!(!paths.log_path.exists());
    assert!(!paths.pid_path.exists());
    assert!(conf.join("bgpd.conf").exists());

    // Nothing left to remove is fine.
    state.clean("r1").unwrap();
}

#[test]
fn test_stale_pid_files() {
    let dir = tempfile::tempdir().unwrap();
    let state = NodeState::new(dir.path(), 0o755, None);
    assert!(state.stale_pid_files().unwrap().is_empty());

    state.prepare().unwrap();
    let run = state.run_dir();
    fs::write(run.join("r1.pid"), format!("{}\n", dead_pid())).unwrap();
    fs::write(run.join("r2.pid"), format!("{}\n", std::process::id())).unwrap();
    fs::write(run.join("r3.pid"), "garbage").unwrap();
    fs::write(run.join("rl-r1.owner"), "deadbeef 1\n").unwrap();

    assert_eq!(state.stale_pid_files().unwrap(), vec!["r1", "r3"]);

    state.clean_pid("r1").unwrap();
    assert!(!run.join("r1.pid").exists());
}
