//! Host readiness: can this process drive `ip netns`, and are the tools a
//! lab needs installed.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::command::{Privilege, check_binary};

static PREFIX_SEQ: AtomicU32 = AtomicU32::new(0);

/// What the host offers for building a lab.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostCheck {
    pub privilege: Privilege,
    /// `ip netns list` succeeds with `privilege`.
    pub netns_usable: bool,
    /// Requested tools not found in `PATH`.
    pub missing: Vec<String>,
}

impl HostCheck {
    /// Check with the detected privilege; `tools` are looked up in `PATH`.
    pub fn inspect(tools: &[&str]) -> Self {
        Self::inspect_with(Privilege::detect(), tools)
    }

    pub fn inspect_with(privilege: Privilege, tools: &[&str]) -> Self {
        let missing = tools
            .iter()
            .filter(|t| check_binary(t).is_none())
            .map(|t| t.to_string())
            .collect();
        Self {
            privilege,
            netns_usable: netns_usable(privilege),
            missing,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.netns_usable && self.missing.is_empty()
    }
}

impl fmt::Display for HostCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_ready() {
            return write!(f, "host ready ({:?})", self.privilege);
        }
        let mut problems = Vec::new();
        if !self.netns_usable {
            problems.push(match self.privilege {
                Privilege::Root => "ip netns not usable".to_string(),
                Privilege::Sudo => "ip netns not usable: need root or passwordless sudo".to_string(),
            });
        }
        if !self.missing.is_empty() {
            problems.push(format!("not in PATH: {}", self.missing.join(", ")));
        }
        f.write_str(&problems.join("; "))
    }
}

/// `ip netns list` works at `privilege` without prompting.
pub fn netns_usable(privilege: Privilege) -> bool {
    privilege.run_checked(&["ip", "netns", "list"]).is_ok()
}

/// Shorthand for `HostCheck::inspect(&[]).netns_usable`.
pub fn check_privileges() -> bool {
    netns_usable(Privilege::detect())
}

/// Namespace prefix unique to this process and call, ending in `-`, for
/// labs that must not collide with each other on one host.
pub fn scratch_prefix(tag: &str) -> String {
    let seq = PREFIX_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{tag}{:x}x{seq}-", std::process::id())
}
