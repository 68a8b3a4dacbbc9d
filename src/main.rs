//! Ephemeral Storage Daemon
//!
//! ## Usage
//!
//! ```bash
//! # Start with defaults
//! ephemeral-storage
//!
//! # Start with custom config
//! ephemeral-storage --config /path/to/config.toml
//!
//! # Serve on another port, hand out public links
//! ephemeral-storage --http-port 8091 --public-base-url https://share.example.com
//! ```
//!
//! ## HTTP API
//!
//! - `GET /health` - Health check
//! - `POST /images?minutes=N&filename=NAME` - Upload
//! - `GET /images/{id}` - Download (until expiry)
//! - `DELETE /images/{id}` - Remove

use anyhow::Context;
use clap::Parser;
use ephemeral_storage::{
    Config, ExpiringStore, FsBlobStore, HttpServer, MetadataIndex, SystemClock,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "ephemeral-storage")]
#[command(about = "Expiring blob storage: uploads vanish after their TTL")]
struct Args {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Storage directory
    #[arg(long, env = "EPHEMERAL_STORAGE_DIR")]
    storage_dir: Option<PathBuf>,

    /// HTTP API port
    #[arg(long)]
    http_port: Option<u16>,

    /// Base URL used in returned locators
    #[arg(long, env = "PUBLIC_BASE_URL")]
    public_base_url: Option<String>,

    /// Seconds between expiry sweeps
    #[arg(long)]
    sweep_interval_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("ephemeral_storage=info".parse()?),
        )
        .init();

    let args = Args::parse();

    // Load config
    let mut config = if let Some(config_path) = &args.config {
        Config::load(config_path)
            .with_context(|| format!("loading config from {}", config_path.display()))?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(dir) = args.storage_dir {
        config.storage_dir = dir;
    }
    if let Some(port) = args.http_port {
        config.http_port = port;
    }
    if let Some(url) = args.public_base_url {
        config.public_base_url = url;
    }
    if let Some(secs) = args.sweep_interval_secs {
        config.sweep_interval_secs = secs;
    }

    config.validate()?;

    info!(
        storage_dir = %config.storage_dir.display(),
        http_port = config.http_port,
        bucket = %config.bucket,
        "Starting ephemeral-storage"
    );

    // Ensure storage directory exists
    tokio::fs::create_dir_all(&config.storage_dir)
        .await
        .context("creating storage directory")?;

    // Save default config if it doesn't exist
    let config_path = config.config_path();
    if !config_path.exists() {
        config.save(&config_path)?;
        info!(path = %config_path.display(), "Created default config");
    }

    let blobs = Arc::new(FsBlobStore::open(config.blobs_dir(), &config.bucket).await?);
    let index = Arc::new(MetadataIndex::open(config.metadata_db_path())?);
    let store = Arc::new(ExpiringStore::new(
        blobs,
        index.clone(),
        Arc::new(SystemClock),
        &config,
    ));

    // Start the sweeper
    let sweeper = Arc::new(store.sweeper(&config)).spawn();

    let http_addr: SocketAddr = format!("0.0.0.0:{}", config.http_port).parse()?;
    let http_server = Arc::new(HttpServer::new(store, http_addr));

    info!("HTTP API available at http://{}", http_addr);
    info!("Locators use {}", config.public_base_url);
    info!("Press Ctrl+C to stop.");

    // Handle shutdown signal
    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!("Shutting down...");
    };

    // Run HTTP server with graceful shutdown
    tokio::select! {
        result = http_server.run() => {
            if let Err(e) = result {
                error!(error = %e, "HTTP server error");
            }
        }
        _ = shutdown => {}
    }

    // Stop the sweeper between passes
    if let Err(e) = sweeper.stop().await {
        error!(error = %e, "Sweeper task failed");
    }

    index.flush().await?;

    Ok(())
}
