//! coherence-node: runs one node of the coherence mesh
//!
//! Loads `coherence-node.toml` (or defaults), starts the node and logs a
//! status line until Ctrl-C.

use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use coherence_node::{Config, MeshNode};

#[derive(Parser)]
#[command(name = "coherence-node")]
#[command(about = "Node of a self-healing coherence mesh")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "coherence-node.toml")]
    config: String,

    /// Node ID (overrides config file)
    #[arg(long, env = "COHERENCE_NODE_ID")]
    node_id: Option<String>,

    /// Gossip port to listen and broadcast on (overrides config file)
    #[arg(long, env = "COHERENCE_PORT")]
    port: Option<u16>,

    /// Seconds between status log lines
    #[arg(long, default_value_t = 10)]
    status_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("coherence_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting coherence-node");
    info!("Config file: {}", cli.config);

    let mut config = if std::path::Path::new(&cli.config).exists() {
        Config::from_file(&cli.config)?
    } else {
        info!("Config file not found, using defaults");
        Config::default()
    };

    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
    }
    if let Some(port) = cli.port {
        config.gossip.listen_port = port;
        config.gossip.broadcast_port = port;
    }

    info!(
        node_id = %config.node.id,
        device_type = %config.node.device_type,
        purpose = %config.node.purpose,
        port = config.gossip.listen_port,
        "Node configuration"
    );

    let mut node = MeshNode::new(config).context("invalid configuration")?;
    node.start().await?;

    let mut status_tick = tokio::time::interval(Duration::from_secs(cli.status_interval.max(1)));
    loop {
        tokio::select! {
            _ = status_tick.tick() => {
                let status = node.status().await;
                info!(
                    phase = %status.phase,
                    coherence = status.coherence,
                    collective_coherence = status.collective_coherence,
                    collective_presence = status.collective_presence,
                    active_peers = status.active_peers,
                    threat_level = ?status.threat_level,
                    pattern = ?status.active_pattern,
                    breaths = status.stats.breaths,
                    "Mesh status"
                );
            }
            result = tokio::signal::ctrl_c() => {
                result.context("waiting for Ctrl-C")?;
                info!("Shutdown signal received");
                break;
            }
        }
    }

    node.stop().await;
    info!("coherence-node stopped");
    Ok(())
}
