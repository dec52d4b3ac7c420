use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use netkit::{HostCheck, IpBackend, NetBackend};
use routelab::config::{LabArgs, LabConfig};
use routelab::node_state::NodeState;
use routelab::{ScriptSession, StdinSession, Topology, TopologyBuilder, TopologyController, WatchMode};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for the binary (non-Windows only)
#[cfg(not(windows))]
#[global_allocator]
static ALLOC: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(
    name = "routelab",
    author,
    version,
    about = "Emulate a routed network in Linux network namespaces"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the topology, open a session, tear down on exit
    Up {
        #[command(flatten)]
        source: TopologySource,
        /// Run session commands from FILE instead of reading stdin
        #[arg(long = "script")]
        script: Option<PathBuf>,
        #[command(flatten)]
        lab: LabArgs,
    },
    /// Validate a topology and its router config without touching the host
    Check {
        #[command(flatten)]
        source: TopologySource,
        #[command(flatten)]
        lab: LabArgs,
    },
    /// Remove namespaces and PID files left by a run that did not exit cleanly
    Clean {
        #[command(flatten)]
        lab: LabArgs,
    },
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct TopologySource {
    /// Topology JSON file
    #[arg(long = "topology")]
    topology: Option<PathBuf>,
    /// Built-in topology: single:K, reversed:K or linear:K,N
    #[arg(long = "preset")]
    preset: Option<String>,
}

impl TopologySource {
    fn load(&self) -> Result<Topology> {
        match (&self.topology, &self.preset) {
            (Some(path), _) => Topology::load(path)
                .with_context(|| format!("failed to load topology {}", path.display())),
            (None, Some(desc)) => Topology::preset(desc).context("invalid preset"),
            (None, None) => bail!("either --topology or --preset is required"),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Up { source, script, lab } => up(&source, script, &lab).await,
        Command::Check { source, lab } => check(&source, &lab),
        Command::Clean { lab } => clean(&lab),
    }
}

async fn up(source: &TopologySource, script: Option<PathBuf>, lab: &LabArgs) -> Result<()> {
    let topo = source.load()?;
    let config = LabConfig::from_cli(lab);
    let backend: Arc<dyn NetBackend> = Arc::new(IpBackend::detect());
    let mut controller = TopologyController::new(backend, config);

    let report = match script {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read script {}", path.display()))?;
            let mut session = ScriptSession::parse(&text);
            controller
                .run(&topo, &mut session, WatchMode::TeardownOnExit)
                .await
        }
        None => {
            controller
                .run(&topo, &mut StdinSession, WatchMode::TeardownOnExit)
                .await
        }
    }
    .context("routelab failed")?;

    if let Some(report) = report
        && !report.is_clean()
    {
        bail!("teardown incomplete: {report}");
    }
    Ok(())
}

fn check(source: &TopologySource, lab: &LabArgs) -> Result<()> {
    let topo = source.load()?;
    let config = LabConfig::from_cli(lab);
    let plan = topo.plan().context("topology is invalid")?;

    let node_state = NodeState::new(&config.base_dir, config.dir_mode, config.daemon_owner);
    let mut problems = 0;
    for router in plan.routers() {
        if let Err(e) = node_state.check_config(&router.name, router.config_dir.as_deref()) {
            warn!("{e}");
            problems += 1;
        }
    }
    let mut tools = vec!["ip"];
    if plan.routers().next().is_some() {
        tools.push(config.daemon.binary.as_str());
    }
    if plan.links.iter().any(|l| !l.shaping.is_empty()) {
        tools.push("tc");
    }
    let host = HostCheck::inspect_with(config.supervisor.privilege, &tools);
    if !host.is_ready() {
        warn!("{host}");
        problems += 1;
    }

    for node in &plan.nodes {
        println!("{:<12} {}", node.name, node.role);
    }
    for link in &plan.links {
        println!(
            "{}:{} <-> {}:{}",
            link.a.node, link.a.iface, link.b.node, link.b.iface
        );
    }
    if problems > 0 {
        bail!("{problems} problem(s) found");
    }
    info!(nodes = plan.nodes.len(), links = plan.links.len(), "topology ok");
    Ok(())
}

fn clean(lab: &LabArgs) -> Result<()> {
    let config = LabConfig::from_cli(lab);
    let backend: Arc<dyn NetBackend> = Arc::new(IpBackend::detect());
    let removed = TopologyBuilder::new(backend, config)
        .clean_stale()
        .context("cleanup failed")?;
    if removed.is_empty() {
        info!("nothing to clean");
    }
    for netns in removed {
        println!("removed {netns}");
    }
    Ok(())
}
