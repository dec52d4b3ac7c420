//! Host-level name allocation.
//!
//! Namespace names and interface names live in process-wide host state. Every
//! build gets an [`InstanceId`]; namespaces are named after their node and
//! protected by an ownership claim file, transient veth names are derived from
//! the instance id so parallel builds never step on each other.

use std::fmt;
use std::fs::{self, File};
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::node_state::remove_if_exists;
use crate::utils::pid_alive;

/// Identifies one build of a topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(u32);

impl InstanceId {
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

impl std::str::FromStr for InstanceId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        u32::from_str_radix(s, 16).map(Self)
    }
}

/// Contents of a namespace ownership claim file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Claim {
    pub instance: InstanceId,
    pub pid: u32,
}

impl Claim {
    fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace();
        let instance = parts.next()?.parse().ok()?;
        let pid = parts.next()?.parse().ok()?;
        Some(Self { instance, pid })
    }

    /// Owner process still exists.
    pub fn is_live(&self) -> bool {
        pid_alive(self.pid)
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance {} pid {}", self.instance, self.pid)
    }
}

/// Result of claiming a namespace name.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Nobody held the name.
    Fresh,
    /// A dead instance held the name; its namespace may still exist and must
    /// be deleted before reuse.
    Reclaimed(Claim),
}

#[derive(Debug)]
pub struct NameAllocator {
    instance: InstanceId,
    prefix: String,
    claims_dir: PathBuf,
    seq: AtomicU32,
}

impl NameAllocator {
    pub fn new(instance: InstanceId, prefix: impl Into<String>, claims_dir: impl Into<PathBuf>) -> Self {
        Self {
            instance,
            prefix: prefix.into(),
            claims_dir: claims_dir.into(),
            seq: AtomicU32::new(0),
        }
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Host namespace name for `node`.
    pub fn netns_name(&self, node: &str) -> String {
        format!("{}{node}", self.prefix)
    }

    /// Fresh pair of host-side veth names, unique to this instance and at
    /// most 15 chars.
    pub fn transient_pair(&self) -> (String, String) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed) & 0xffff;
        let stem = format!("v{}{seq:x}", self.instance);
        (format!("{stem}a"), format!("{stem}b"))
    }

    pub fn claim_path(&self, netns: &str) -> PathBuf {
        self.claims_dir.join(format!("{netns}.owner"))
    }

    /// Read the current claim on `netns`, if any.
    pub fn read_claim(&self, netns: &str) -> Option<Claim> {
        fs::read_to_string(self.claim_path(netns))
            .ok()
            .and_then(|t| Claim::parse(&t))
    }

    /// Take ownership of `netns` for this instance.
    ///
    /// `exists_on_host` tells whether a namespace with that name is already
    /// present. A live foreign claim, or an unclaimed existing namespace,
    /// is a [`Error::NameCollision`]; a claim whose owner is dead is stale
    /// and is taken over.
    ///
    /// Runs under an exclusive lock on the claims directory, so of several
    /// instances racing for the same stale claim exactly one wins.
    pub fn claim(&self, netns: &str, exists_on_host: bool) -> Result<ClaimOutcome> {
        fs::create_dir_all(&self.claims_dir).map_err(|e| Error::io(&self.claims_dir, e))?;
        let _lock = DirLock::exclusive(&self.claims_dir)?;
        let path = self.claim_path(netns);

        let mut outcome = ClaimOutcome::Fresh;
        match self.read_claim(netns) {
            Some(existing) if existing.instance == self.instance || existing.is_live() => {
                return Err(Error::NameCollision {
                    name: netns.to_string(),
                    owner: Some(existing.to_string()),
                });
            }
            Some(stale) => {
                info!(ns = netns, owner = %stale, "reclaiming stale namespace claim");
                remove_if_exists(&path)?;
                outcome = ClaimOutcome::Reclaimed(stale);
            }
            None if exists_on_host => {
                return Err(Error::NameCollision {
                    name: netns.to_string(),
                    owner: None,
                });
            }
            None => {}
        }

        let claim = Claim {
            instance: self.instance,
            pid: std::process::id(),
        };
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                return Err(Error::NameCollision {
                    name: netns.to_string(),
                    owner: self.read_claim(netns).map(|c| c.to_string()),
                });
            }
            Err(e) => return Err(Error::io(&path, e)),
        };
        writeln!(file, "{} {}", claim.instance, claim.pid).map_err(|e| Error::io(&path, e))?;
        debug!(ns = netns, instance = %self.instance, "claimed namespace name");
        Ok(outcome)
    }

    /// Drop this instance's claim on `netns`. Claims held by others are left
    /// untouched.
    pub fn release(&self, netns: &str) -> Result<()> {
        let _lock = match DirLock::exclusive(&self.claims_dir) {
            Ok(lock) => lock,
            // No claims directory, nothing to release.
            Err(Error::Io { ref source, .. }) if source.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.read_claim(netns) {
            Some(c) if c.instance == self.instance => remove_if_exists(&self.claim_path(netns)),
            _ => Ok(()),
        }
    }

    /// Namespaces under `prefix` whose claims are stale (owner dead).
    pub fn stale_claims(&self) -> Result<Vec<(String, Claim)>> {
        let entries = match fs::read_dir(&self.claims_dir) {
            Ok(e) => e,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io(&self.claims_dir, e)),
        };
        let mut stale = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(netns) = name.strip_suffix(".owner") else {
                continue;
            };
            if !netns.starts_with(&self.prefix) {
                continue;
            }
            if let Some(claim) = self.read_claim(netns)
                && !claim.is_live()
            {
                stale.push((netns.to_string(), claim));
            }
        }
        stale.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(stale)
    }
}

/// `flock(2)` on a directory, released on drop.
struct DirLock {
    dir: File,
}

impl DirLock {
    fn exclusive(path: &Path) -> Result<Self> {
        let dir = File::open(path).map_err(|e| Error::io(path, e))?;
        // SAFETY: flock on a descriptor owned by `dir` for the guard's lifetime
        if unsafe { libc::flock(dir.as_raw_fd(), libc::LOCK_EX) } != 0 {
            return Err(Error::io(path, io::Error::last_os_error()));
        }
        Ok(Self { dir })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        // SAFETY: unlocking the descriptor locked in `exclusive`
        if unsafe { libc::flock(self.dir.as_raw_fd(), libc::LOCK_UN) } != 0 {
            warn!("claims unlock failed: {}", io::Error::last_os_error());
        }
    }
}
