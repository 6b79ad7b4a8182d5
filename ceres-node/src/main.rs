use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ceres_node::{NodeConfig, Server, DEFAULT_MAX_PEERS};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Directory for this node's keys and database
    #[arg(long, short)]
    path: PathBuf,
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0:0")]
    addr: String,
    /// Maximum number of connected outbound peers
    #[arg(long, default_value_t = DEFAULT_MAX_PEERS)]
    max_peers: u32,
    /// Addresses of existing nodes to bootstrap into
    #[arg(long)]
    bootstrap: Vec<String>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let version = env!("CARGO_PKG_VERSION");
    println!("Starting ceres-node, version {version}");

    let args = Args::parse();
    let node = Server::open(NodeConfig {
        path: args.path,
        max_peers: args.max_peers,
    })?;
    node.listen(&args.addr).await?;

    for addr in &args.bootstrap {
        if let Err(err) = node.bootstrap_add_peer(addr).await {
            warn!(addr = %addr, "bootstrap failed: {err}");
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("interrupt received, shutting down");
    node.close().await?;
    Ok(())
}
