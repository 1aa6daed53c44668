//! convoy daemon: HTTP API, notifications and patrol loops over the shared
//! coordination store.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use cv_core::config::Config;
use cv_telemetry::logging::{self, LogFormat};
use tracing::info;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "cv-daemon", version, about = "convoy coordination daemon")]
struct Args {
    /// Config file (default: ~/.convoy/config.toml).
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => Config::load().context("failed to load config")?,
    };

    logging::init(
        "cv-daemon",
        LogFormat::parse(&config.general.log_format),
        &config.general.log_level,
    );
    info!(
        version = env!("CARGO_PKG_VERSION"),
        project_id = %config.general.project_id,
        "convoy daemon starting"
    );

    let daemon = cv_daemon::daemon::Daemon::new(config).await?;

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, shutting down");
            shutdown.shutdown();
        }
    });

    daemon.run().await
}
