//! Arbor node binary.
//!
//! Starts a coordinator node over the data directory given on the command
//! line: loads `arbor.toml` from it, brings the node up, and runs until
//! interrupted. Logging is controlled through `RUST_LOG`.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use arbor::config::ArborConfig;
use arbor::gossip::{GossipChannel, LocalGossipHub};
use arbor::node::Node;

/// Arbor DAG-ledger coordinator node.
#[derive(Parser, Debug)]
#[command(name = "arbor", version, about = "Arbor DAG-ledger coordinator node")]
struct Cli {
    /// Data directory holding the ledger, identity key, and `arbor.toml`.
    #[arg(long, default_value = "./arbor-data")]
    data_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ArborConfig::load(&cli.data_dir);
    // The directory on the command line wins; `arbor.toml` lives inside it.
    config.node.data_dir = cli.data_dir.to_string_lossy().into_owned();

    let hub: Arc<dyn GossipChannel> = Arc::new(LocalGossipHub::default());
    let node = Node::start(&config, hub).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");
    node.shutdown().await?;
    Ok(())
}
