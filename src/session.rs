//! Operator sessions against a running topology.
//!
//! A [`Session`] is handed a [`TopologyView`] once the build succeeds and
//! runs until the operator is done. Two are provided: [`StdinSession`] reads
//! commands interactively, [`ScriptSession`] replays a fixed list.

use std::future::Future;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, warn};

use crate::builder::TopologyView;
use crate::error::{Error, Result};
use crate::reconcile::NodeEvent;
use crate::status::TopologyStatus;

const CONSOLE_PROBE: std::time::Duration = std::time::Duration::from_millis(300);

pub trait Session: Send {
    /// Drive the session. Returning ends the session; the controller decides
    /// what happens to the topology afterwards.
    fn run(
        &mut self,
        view: TopologyView,
        events: UnboundedReceiver<NodeEvent>,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// Result of one session command.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CmdOutcome {
    pub output: String,
    pub quit: bool,
}

impl CmdOutcome {
    fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            quit: false,
        }
    }
}

const HELP: &str = "\
commands:
  nodes                   list nodes
  links                   list links
  status                  topology status as JSON
  exec <node> <cmd...>    run a command inside a node's namespace
  console <node>          show a router's management console
  quit                    end the session";

/// Apply a session command.
///
/// Commands:
/// - `nodes` / `links` - list the topology
/// - `status` - JSON status snapshot
/// - `exec <node> <cmd...>` - run a command inside the node's namespace
/// - `console <node>` - console address of a router's daemon
/// - `quit` / `exit` - end the session
pub fn apply_cmd(view: &TopologyView, cmd: &str) -> CmdOutcome {
    let parts: Vec<&str> = cmd.split_whitespace().collect();
    let Some((&head, rest)) = parts.split_first() else {
        return CmdOutcome::default();
    };

    match head {
        "help" | "?" => CmdOutcome::text(HELP),

        "nodes" => {
            let status = TopologyStatus::collect(view);
            let lines: Vec<String> = status
                .nodes
                .iter()
                .map(|n| {
                    let mut line = format!(
                        "{:<12} {:<7} {}",
                        n.name,
                        n.role.to_string(),
                        n.interfaces.join(",")
                    );
                    if let Some(d) = &n.daemon {
                        match d.pid {
                            Some(pid) => line.push_str(&format!("  pid {pid}")),
                            None => line.push_str("  (daemon down)"),
                        }
                    }
                    line
                })
                .collect();
            CmdOutcome::text(lines.join("\n"))
        }

        "links" => {
            let lines: Vec<String> = view
                .plan()
                .links
                .iter()
                .map(|l| {
                    let mut line = format!("{}:{} <-> {}:{}", l.a.node, l.a.iface, l.b.node, l.b.iface);
                    if !l.shaping.is_empty() {
                        line.push_str(&format!("  [{}]", l.shaping.netem_args().join(" ")));
                    }
                    line
                })
                .collect();
            CmdOutcome::text(lines.join("\n"))
        }

        "status" => CmdOutcome::text(TopologyStatus::collect(view).to_json()),

        "exec" => {
            let [node, program, args @ ..] = rest else {
                return CmdOutcome::text("usage: exec <node> <cmd...>");
            };
            match exec_in(view, node, program, args) {
                Ok(out) => CmdOutcome::text(out),
                Err(e) => CmdOutcome::text(format!("error: {e}")),
            }
        }

        "console" => {
            let [node] = rest else {
                return CmdOutcome::text("usage: console <node>");
            };
            match console_info(view, node) {
                Ok(out) => CmdOutcome::text(out),
                Err(e) => CmdOutcome::text(format!("error: {e}")),
            }
        }

        "quit" | "exit" => CmdOutcome {
            output: String::new(),
            quit: true,
        },

        other => CmdOutcome::text(format!("unknown command: {other} (try 'help')")),
    }
}

fn exec_in(view: &TopologyView, node: &str, program: &str, args: &[&str]) -> Result<String> {
    let env = view.enter_namespace(node)?;
    let output = env
        .command(program)
        .args(args)
        .output()
        .map_err(|e| Error::Host {
            op: format!("exec {program} in '{node}'"),
            reason: e.to_string(),
        })?;
    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        text.push_str(&format!("({})", output.status));
    }
    Ok(text.trim_end().to_string())
}

fn console_info(view: &TopologyView, node: &str) -> Result<String> {
    let console = view.console(node)?;
    let env = view.enter_namespace(node)?;
    let state = if env.probe_tcp(console.port, CONSOLE_PROBE) {
        "listening"
    } else {
        "not answering"
    };
    let mut text = format!(
        "{node}: 127.0.0.1:{} in netns {} ({state})\nconnect with: ip netns exec {} telnet 127.0.0.1 {}",
        console.port, console.netns, console.netns, console.port
    );
    if let Some(credential) = &console.credential {
        text.push_str(&format!("\npassword: {credential}"));
    }
    Ok(text)
}

/// Interactive line-oriented session on stdin/stdout.
#[derive(Debug, Default)]
pub struct StdinSession;

impl Session for StdinSession {
    async fn run(&mut self, view: TopologyView, mut events: UnboundedReceiver<NodeEvent>) -> Result<()> {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        println!("{} nodes up; type 'help' for commands", view.plan().nodes.len());

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = match line {
                        Ok(Some(line)) => line,
                        // EOF ends the session.
                        Ok(None) => break,
                        Err(e) => {
                            warn!("stdin read failed: {e}");
                            break;
                        }
                    };
                    let view = view.clone();
                    let outcome = tokio::task::spawn_blocking(move || apply_cmd(&view, line.trim()))
                        .await
                        .unwrap_or_else(|e| CmdOutcome::text(format!("error: {e}")));
                    if !outcome.output.is_empty() {
                        println!("{}", outcome.output);
                    }
                    if outcome.quit {
                        break;
                    }
                }
                Some(event) = events.recv() => {
                    println!("* {event}");
                }
            }
        }
        Ok(())
    }
}

/// Runs a fixed list of commands, then ends.
#[derive(Debug, Default)]
pub struct ScriptSession {
    commands: Vec<String>,
    transcript: Vec<(String, String)>,
    events: Vec<NodeEvent>,
}

impl ScriptSession {
    pub fn new<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            commands: commands.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Parse a script: one command per line, `#` starts a comment.
    pub fn parse(script: &str) -> Self {
        Self::new(
            script
                .lines()
                .map(|l| l.split('#').next().unwrap_or_default().trim())
                .filter(|l| !l.is_empty()),
        )
    }

    /// `(command, output)` pairs from the last run.
    pub fn transcript(&self) -> &[(String, String)] {
        &self.transcript
    }

    /// Node events observed while the script ran.
    pub fn events(&self) -> &[NodeEvent] {
        &self.events
    }
}

impl Session for ScriptSession {
    async fn run(&mut self, view: TopologyView, mut events: UnboundedReceiver<NodeEvent>) -> Result<()> {
        self.transcript.clear();
        for cmd in self.commands.clone() {
            let v = view.clone();
            let c = cmd.clone();
            let outcome = tokio::task::spawn_blocking(move || apply_cmd(&v, &c))
                .await
                .unwrap_or_else(|e| CmdOutcome::text(format!("error: {e}")));
            info!(cmd = %cmd, "script command");
            if !outcome.output.is_empty() {
                println!("{}", outcome.output);
            }
            self.transcript.push((cmd, outcome.output));
            if outcome.quit {
                break;
            }
        }
        while let Ok(event) = events.try_recv() {
            self.events.push(event);
        }
        Ok(())
    }
}
