//! Privileged host command execution.
//!
//! Everything that touches the host network stack goes through `ip`/`tc`.
//! When the current process is not root the commands are wrapped in
//! `sudo -n`, which fails instead of prompting for a password.

use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Output};

use anyhow::{Context, Result};

/// How host commands gain the privileges they need.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Privilege {
    /// Already running as root; commands run directly.
    Root,
    /// Commands are prefixed with `sudo -n`.
    #[default]
    Sudo,
}

impl Privilege {
    /// Root when the effective uid is 0, `sudo` otherwise.
    pub fn detect() -> Self {
        // SAFETY: geteuid has no preconditions and cannot fail
        if unsafe { libc::geteuid() } == 0 {
            Privilege::Root
        } else {
            Privilege::Sudo
        }
    }

    /// Build a `Command` for `program args...` with this privilege level.
    pub fn command(self, program: &str) -> Command {
        match self {
            Privilege::Root => Command::new(program),
            Privilege::Sudo => {
                let mut cmd = Command::new("sudo");
                cmd.arg("-n").arg(program);
                cmd
            }
        }
    }

    /// Run `args[0] args[1..]`, returning raw output.
    pub fn run(self, args: &[&str]) -> Result<Output> {
        let (program, rest) = args.split_first().context("empty command line")?;
        self.command(program)
            .args(rest)
            .output()
            .with_context(|| format!("run {}", self.render(args)))
    }

    /// Run and fail with a [`CommandFailed`] carrying stderr on non-zero exit.
    pub fn run_checked(self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            return Err(CommandFailed {
                command: self.render(args),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(output)
    }

    fn render(self, args: &[&str]) -> String {
        match self {
            Privilege::Root => args.join(" "),
            Privilege::Sudo => format!("sudo -n {}", args.join(" ")),
        }
    }
}

/// A host command that ran but exited non-zero.
///
/// Kept as a concrete type inside `anyhow::Error` so callers can
/// `downcast_ref` and classify on `stderr`.
#[derive(Debug, Clone)]
pub struct CommandFailed {
    pub command: String,
    pub stderr: String,
}

impl fmt::Display for CommandFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "command failed: {}\n{}", self.command, self.stderr)
    }
}

impl std::error::Error for CommandFailed {}

/// Check if a binary exists in PATH.
pub fn check_binary(name: &str) -> Option<PathBuf> {
    Command::new("sh")
        .args(["-c", "command -v \"$1\"", "sh", name])
        .output()
        .ok()
        .filter(|o| o.status.success())
        .map(|o| PathBuf::from(String::from_utf8_lossy(&o.stdout).trim().to_string()))
}
