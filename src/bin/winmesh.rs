//! winmesh - Runs peers of the presence protocol in one process
//!
//! This binary starts a simulated set of windows sharing one broadcast
//! channel and prints what each of them sees.
//!
//! # Usage
//!
//! ```bash
//! # Open a root window with two children, then terminate the root
//! winmesh simulate --children 2
//!
//! # Children opened as popups, settings from a file
//! winmesh simulate --children 3 --popup --config winmesh.toml
//!
//! # Keep the peers running until interrupted
//! winmesh simulate --children 2 --hold
//!
//! # Print the effective configuration
//! WINMESH_MAX_PEERS=16 winmesh config
//!
//! # Enable debug logging
//! RUST_LOG=winmesh_node=debug winmesh simulate
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Stops every peer without announcing `close`

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use winmesh_core::PeerView;
use winmesh_node::sim::{SimPeer, Simulation};
use winmesh_node::{NodeConfig, OpenOptions};

/// How long the peers get to agree on membership.
const CONVERGE_TIMEOUT: Duration = Duration::from_secs(5);

/// winmesh - coordinator-free presence for peers on a broadcast channel
#[derive(Parser, Debug)]
#[command(name = "winmesh", version, about)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Open a root window and children, then terminate the root
    Simulate {
        /// Number of windows the root opens
        #[arg(short = 'n', long, default_value_t = 2)]
        children: usize,

        /// Open the children as popups
        #[arg(long)]
        popup: bool,

        /// Keep the surviving peers running until interrupted
        #[arg(long)]
        hold: bool,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(args.config)?;

    match args.command.unwrap_or(Command::Simulate {
        children: 2,
        popup: false,
        hold: false,
    }) {
        Command::Simulate {
            children,
            popup,
            hold,
        } => run_simulation(config, children, popup, hold),
        Command::Config => {
            let rendered =
                toml::to_string_pretty(&config).context("Failed to render configuration")?;
            print!("{rendered}");
            Ok(())
        }
    }
}

/// Reads the configuration file, if any, with environment overrides applied.
fn load_config(path: Option<PathBuf>) -> Result<NodeConfig> {
    NodeConfig::load(path.as_deref()).context("Failed to load configuration")
}

/// Runs the simulation (async entry point).
#[tokio::main]
async fn run_simulation(config: NodeConfig, children: usize, popup: bool, hold: bool) -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("winmesh_node=info".parse()?)
                .add_directive("winmesh_core=info".parse()?)
                .add_directive("winmesh_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        channel = %config.channel_name,
        "winmesh simulation starting"
    );

    // Create cancellation token for graceful shutdown
    let cancel_token = CancellationToken::new();

    // Setup signal handlers
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let sim = Simulation::new(config);
    let result = tokio::select! {
        _ = cancel_token.cancelled() => Ok(()),
        result = scenario(&sim, children, popup, hold, &cancel_token) => result,
    };

    sim.shutdown();
    info!("winmesh simulation stopped");
    result
}

async fn scenario(
    sim: &Simulation,
    children: usize,
    popup: bool,
    hold: bool,
    cancel_token: &CancellationToken,
) -> Result<()> {
    let root = sim.spawn_root().context("Failed to start root peer")?;
    for _ in 0..children {
        root.handle
            .open_related_peer(OpenOptions { popup })
            .await
            .context("Failed to open child peer")?;
    }
    converge(sim).await?;

    println!("== {} peers after opening", sim.live_peers().len());
    print_views(sim).await;

    if !root.host.terminate().await {
        bail!("Root peer stopped before it could be terminated");
    }
    wait_until_gone(&root).await?;
    converge(sim).await?;

    println!("== {} peers after terminating {}", sim.live_peers().len(), root.id());
    print_views(sim).await;

    if hold {
        info!("Holding peers until interrupted");
        cancel_token.cancelled().await;
    }
    Ok(())
}

async fn converge(sim: &Simulation) -> Result<()> {
    match tokio::time::timeout(CONVERGE_TIMEOUT, sim.converge()).await {
        Ok(true) => Ok(()),
        Ok(false) => bail!("A peer stopped before membership converged"),
        Err(_) => bail!("Membership did not converge within {CONVERGE_TIMEOUT:?}"),
    }
}

async fn wait_until_gone(peer: &SimPeer) -> Result<()> {
    let mut changes = peer.handle.changes();
    let stopped = tokio::time::timeout(CONVERGE_TIMEOUT, async {
        // The counter closes with the actor
        while changes.changed().await.is_ok() {}
    })
    .await;
    if stopped.is_err() {
        warn!(peer_id = %peer.id(), "Peer still running after termination");
        bail!("Peer {} did not stop", peer.id());
    }
    Ok(())
}

async fn print_views(sim: &Simulation) {
    for peer in sim.live_peers() {
        let views = peer.handle.peers().await;
        let viewer = views.iter().find(|view| view.is_local);
        println!("{} sees:", peer.id());
        for view in &views {
            println!("  {}", describe(view, viewer));
        }
    }
}

fn describe(view: &PeerView, viewer: Option<&PeerView>) -> String {
    let mut line = view.label(viewer);
    if view.state.user != serde_json::Value::Null {
        line.push_str(&format!(" {}", view.state.user));
    }
    line
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
