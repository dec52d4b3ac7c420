//! Per-node persistent state on disk.
//!
//! Layout under the lab base directory:
//!
//! ```text
//! <base>/conf/<node>/     router startup config (must pre-exist, never created)
//! <base>/log/<node>.log   daemon stdout/stderr
//! <base>/run/<node>.pid   daemon PID
//! ```

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};
use crate::utils::{pid_alive, read_pid_file};

/// Paths owned by one node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodePaths {
    pub config_dir: PathBuf,
    pub log_path: PathBuf,
    pub pid_path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct NodeState {
    base: PathBuf,
    dir_mode: u32,
    owner: Option<(u32, u32)>,
}

impl NodeState {
    /// `dir_mode` applies to directories this call creates; `owner` (uid,
    /// gid) is applied to them too so a daemon running unprivileged can write.
    pub fn new(base: impl Into<PathBuf>, dir_mode: u32, owner: Option<(u32, u32)>) -> Self {
        Self {
            base: base.into(),
            dir_mode,
            owner,
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn conf_root(&self) -> PathBuf {
        self.base.join("conf")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base.join("log")
    }

    pub fn run_dir(&self) -> PathBuf {
        self.base.join("run")
    }

    /// Derive the node's paths. Pure; touches nothing.
    pub fn paths(&self, node: &str, config_dir: Option<&Path>) -> NodePaths {
        NodePaths {
            config_dir: config_dir
                .map(Path::to_path_buf)
                .unwrap_or_else(|| self.conf_root().join(node)),
            log_path: self.log_dir().join(format!("{node}.log")),
            pid_path: self.run_dir().join(format!("{node}.pid")),
        }
    }

    /// Check that the router's config directory exists, is readable and has
    /// content. Never creates it.
    pub fn check_config(&self, node: &str, config_dir: Option<&Path>) -> Result<PathBuf> {
        let dir = self.paths(node, config_dir).config_dir;
        let missing = || Error::ConfigMissing {
            node: node.to_string(),
            path: dir.clone(),
        };
        let mut entries = fs::read_dir(&dir).map_err(|_| missing())?;
        if entries.next().is_none() {
            return Err(missing());
        }
        Ok(dir)
    }

    /// Make sure the node's log and run directories exist and its config
    /// directory is present. Idempotent.
    pub fn ensure(&self, node: &str, config_dir: Option<&Path>) -> Result<NodePaths> {
        self.check_config(node, config_dir)?;
        self.prepare()?;
        Ok(self.paths(node, config_dir))
    }

    /// Create the shared log and run directories.
    pub fn prepare(&self) -> Result<()> {
        self.ensure_dir(&self.log_dir())?;
        self.ensure_dir(&self.run_dir())
    }

    /// Remove the node's log and PID file. The config directory is left alone.
    pub fn clean(&self, node: &str) -> Result<()> {
        let paths = self.paths(node, None);
        for path in [&paths.log_path, &paths.pid_path] {
            remove_if_exists(path)?;
        }
        debug!(node, "removed node state");
        Ok(())
    }

    /// Remove only the node's PID file.
    pub fn clean_pid(&self, node: &str) -> Result<()> {
        remove_if_exists(&self.paths(node, None).pid_path)
    }

    /// Nodes whose PID file names a process that no longer exists.
    pub fn stale_pid_files(&self) -> Result<Vec<String>> {
        let dir = self.run_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&dir, e)),
        };
        let mut stale = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "pid") {
                continue;
            }
            let Some(node) = path.file_stem().map(|s| s.to_string_lossy().to_string()) else {
                continue;
            };
            if read_pid_file(&path).is_none_or(|pid| !pid_alive(pid)) {
                stale.push(node);
            }
        }
        stale.sort();
        Ok(stale)
    }

    fn ensure_dir(&self, dir: &Path) -> Result<()> {
        if dir.is_dir() {
            return Ok(());
        }
        match fs::create_dir_all(dir) {
            Ok(()) => {}
            // Lost a race with a parallel ensure.
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists && dir.is_dir() => return Ok(()),
            Err(e) => return Err(Error::io(dir, e)),
        }
        fs::set_permissions(dir, fs::Permissions::from_mode(self.dir_mode))
            .map_err(|e| Error::io(dir, e))?;
        if let Some((uid, gid)) = self.owner {
            std::os::unix::fs::chown(dir, Some(uid), Some(gid)).map_err(|e| Error::io(dir, e))?;
        }
        debug!(dir = %dir.display(), mode = format!("{:o}", self.dir_mode), "created state dir");
        Ok(())
    }
}

/// Remove a file, treating "already gone" as success.
pub(crate) fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::io(path, e)),
    }
}
