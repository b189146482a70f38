//! Larch node binary - standalone isolate entry point.
//!
//! Runs one isolate's discovery engine: the signal receiver, the registry
//! endpoint, the periodic re-announcer, and (when enabled) the multicast
//! discovery peer. Configuration is loaded from environment variables, a
//! TOML file, or CLI arguments (lowest to highest precedence).
//!
//! # Usage
//!
//! ```bash
//! # Start with a TOML config
//! larch-node --config /etc/larch/isolate.toml
//!
//! # Start with CLI args only
//! larch-node --isolate-uid worker-1 --http-addr 0.0.0.0:9010
//!
//! # Environment variables
//! export LARCH_ISOLATE_UID=worker-1
//! larch-node
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use larch::bootstrap::bootstrap_isolate;
use larch::config::IsolateConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "larch-node", about = "Run one isolate's discovery engine")]
struct Args {
    /// Path to a TOML configuration file.
    #[arg(long, env = "LARCH_CONFIG")]
    config: Option<PathBuf>,

    /// Unique identifier of this isolate.
    #[arg(long)]
    isolate_uid: Option<String>,

    /// Bind address of the HTTP listener (signals + registry).
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// TOML file backing the signal directory.
    #[arg(long)]
    directory_file: Option<PathBuf>,

    /// Enable the multicast discovery peer.
    #[arg(long)]
    multicast: bool,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let args = Args::parse();

    let mut config =
        IsolateConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    if let Some(uid) = args.isolate_uid {
        config.isolate_uid = uid;
    }
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    if let Some(path) = args.directory_file {
        config.directory_file = Some(path);
    }
    if args.multicast {
        config.multicast.enabled = true;
    }

    info!(
        isolate = %config.isolate_uid,
        "starting larch node v{}",
        env!("CARGO_PKG_VERSION")
    );

    let handle = bootstrap_isolate(config).await?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("shutdown requested");
    handle.shutdown().await;
    Ok(())
}
