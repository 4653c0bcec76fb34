//! relaykv node binary

use clap::Parser;
use relaykv::{Node, NodeConfig, NodeRole};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "relaykv-node")]
#[command(about = "relaykv node - replicated key-value store (master or replica)")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Node ID, reported to the master by replicas
    #[arg(long)]
    node_id: Option<String>,

    /// Role: master or replica
    #[arg(long)]
    role: Option<NodeRole>,

    /// Data directory
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Storage engine (sled, sqlite, filesystem, memory)
    #[arg(short, long)]
    engine: Option<String>,

    /// HTTP address to listen on
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Master base URL (replicas only)
    #[arg(long)]
    master_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // File and RELAYKV_* environment first, then CLI overrides
    let mut config = NodeConfig::load(args.config.as_deref())?;
    if let Some(node_id) = args.node_id {
        config.node_id = node_id;
    }
    if let Some(role) = args.role {
        config.role = role;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(engine) = args.engine {
        config.engine = engine;
    }
    if let Some(http_addr) = args.http_addr {
        config.http_addr = http_addr;
    }
    if let Some(master_url) = args.master_url {
        config.master_url = Some(master_url);
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("relaykv {}", relaykv::VERSION);
    Node::new(config).serve().await?;
    Ok(())
}
