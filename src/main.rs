//! CLI entrypoint: loads configuration, starts the agent mesh node, and
//! blocks until interrupted.

use agentmesh_directory::config::Config;
use agentmesh_directory::facade::AgentMeshNode;
use agentmesh_directory::{logging, Result};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Set the verbosity level
    #[arg(short, long, default_value = "info")]
    verbosity: String,

    /// Path to a TOML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Gossip listen port (overrides the config file when set)
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    logging::init(&args.verbosity);

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(port) = args.port {
        config.p2p.gossip.port = port;
    }

    let node = AgentMeshNode::start(&config).await?;
    tracing::info!(node_id = %node.node_id, "agent mesh node started");

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.stop();

    Ok(())
}
