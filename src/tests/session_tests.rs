use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::builder::{RunningTopology, TopologyBuilder};
use crate::reconcile::NodeEvent;
use crate::session::{CmdOutcome, ScriptSession, Session, apply_cmd};
use crate::test_helpers::{MemoryBackend, test_config, write_router_config};
use crate::topology::Topology;

fn start(dir: &Path) -> RunningTopology {
    write_router_config(dir, "r1");
    let builder = TopologyBuilder::new(Arc::new(MemoryBackend::new()), test_config(dir));
    let mut topo = Topology::single(2);
    topo.add_router("r1", None);
    topo.add_link("r1", "s1").delay_ms = Some(10);
    builder.build(&topo).unwrap()
}

#[test]
fn test_nodes_lists_everything() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(dir.path());
    let out = apply_cmd(&running.view(), "nodes");
    assert!(!out.quit);

    let lines: Vec<&str> = out.output.lines().collect();
    assert_eq!(lines.len(), 4);
    assert!(lines[0].starts_with("h1"));
    assert!(lines[0].contains("host"));
    assert!(lines[2].starts_with("r1"));
    assert!(lines[2].contains("pid "));
    assert!(lines[3].contains("eth1,eth2,eth3"));
}

#[test]
fn test_links_show_shaping() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(dir.path());
    let out = apply_cmd(&running.view(), "links");
    let lines: Vec<&str> = out.output.lines().collect();
    assert_eq!(lines[0], "h1:eth0 <-> s1:eth1");
    assert!(lines[2].starts_with("r1:eth0 <-> s1:eth3"));
    assert!(lines[2].contains("delay 10ms"));
}

#[test]
fn test_status_json() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(dir.path());
    let out = apply_cmd(&running.view(), "status");
    let json: serde_json::Value = serde_json::from_str(&out.output).unwrap();

    assert_eq!(json["instance"], running.instance().to_string());
    assert_eq!(json["live_links"], 3);
    let nodes = json["nodes"].as_array().unwrap();
    assert_eq!(nodes.len(), 4);
    let r1 = nodes.iter().find(|n| n["name"] == "r1").unwrap();
    assert_eq!(r1["role"], "router");
    assert_eq!(r1["netns"], "rlt-r1");
    assert_eq!(r1["daemon"]["alive"], true);
    assert_eq!(r1["daemon"]["console_port"], 2605);
    let h1 = nodes.iter().find(|n| n["name"] == "h1").unwrap();
    assert!(h1.get("daemon").is_none());
}

#[test]
fn test_exec_runs_command() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(dir.path());
    let view = running.view();

    assert_eq!(apply_cmd(&view, "exec h1 echo hi").output, "hi");
    let failed = apply_cmd(&view, "exec h1 false").output;
    assert!(failed.contains("exit status: 1"), "{failed}");
    assert!(apply_cmd(&view, "exec nobody echo hi").output.starts_with("error:"));
    assert!(apply_cmd(&view, "exec h1").output.starts_with("usage:"));
}

#[test]
fn test_console_not_answering() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(dir.path());
    let out = apply_cmd(&running.view(), "console r1").output;
    assert!(out.contains("127.0.0.1:2605"), "{out}");
    assert!(out.contains("rlt-r1"));
    assert!(out.contains("not answering"));

    assert!(apply_cmd(&running.view(), "console h1").output.starts_with("error:"));
}

#[test]
fn test_misc_commands() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(dir.path());
    let view = running.view();

    assert!(apply_cmd(&view, "help").output.contains("exec <node>"));
    assert_eq!(apply_cmd(&view, "   "), CmdOutcome::default());
    assert!(apply_cmd(&view, "frobnicate").output.starts_with("unknown command"));
    assert!(apply_cmd(&view, "quit").quit);
    assert!(apply_cmd(&view, "exit").quit);
}

#[test]
fn test_script_parse_skips_comments() {
    let session = ScriptSession::parse("# setup\nnodes\n\n  links   # all of them\n");
    assert!(session.transcript().is_empty());
    let dir = tempfile::tempdir().unwrap();
    let running = start(dir.path());

    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut session = session;
    let (tx, rx) = mpsc::unbounded_channel();
    tx.send(NodeEvent::Exited {
        node: "r1".into(),
        code: Some(1),
    })
    .unwrap();
    rt.block_on(session.run(running.view(), rx)).unwrap();

    let cmds: Vec<&str> = session.transcript().iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(cmds, vec!["nodes", "links"]);
    assert_eq!(session.events().len(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_script_stops_at_quit() {
    let dir = tempfile::tempdir().unwrap();
    let running = start(dir.path());
    let mut session = ScriptSession::new(["nodes", "quit", "links"]);
    let (_tx, rx) = mpsc::unbounded_channel();
    session.run(running.view(), rx).await.unwrap();

    assert_eq!(session.transcript().len(), 2);
    assert_eq!(session.transcript()[1], ("quit".to_string(), String::new()));
    tokio::task::block_in_place(move || drop(running));
}
