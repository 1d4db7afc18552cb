//! Standalone embedded store.
//!
//! Usage: `cachet-server [ADDR]` (default `127.0.0.1:6379`, or `CACHET_ADDR`).
//! Log verbosity follows `RUST_LOG`.

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cachet_server::EmbeddedServer;

const DEFAULT_ADDR: &str = "127.0.0.1:6379";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let addr = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CACHET_ADDR").ok())
        .unwrap_or_else(|| DEFAULT_ADDR.to_string());

    let server = EmbeddedServer::bind(addr.as_str())
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(addr = %server.local_addr(), "shutting down");
    server.shutdown();
    Ok(())
}
