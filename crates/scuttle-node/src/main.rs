//! # scuttle-node
//!
//! Runs a single Scuttlebutt peer: listens for inbound peers, dials the
//! configured pubs and replicates until Ctrl+C.

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scuttle_node::{Node, NodeConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,scuttle_node=debug")),
        )
        .init();

    info!("Starting scuttle-node v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = NodeConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open storage and start replication
    // -----------------------------------------------------------------------
    let root = CancellationToken::new();
    let mut node = Node::open(config, root.clone()).await?;

    // -----------------------------------------------------------------------
    // 4. Accept inbound peers
    // -----------------------------------------------------------------------
    let listener = node.bind().await?;
    info!(addr = %listener.local_addr()?, identity = %node.public(), "Listening");
    node.listen(listener);

    // -----------------------------------------------------------------------
    // 5. Run until Ctrl+C
    // -----------------------------------------------------------------------
    tokio::signal::ctrl_c().await?;
    info!("Received Ctrl+C, shutting down");
    node.shutdown().await;

    Ok(())
}
