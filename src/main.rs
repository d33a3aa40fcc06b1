//! # Gatehouse - Main Entry Point
//!
//! Loads the configuration, installs logging and metrics, binds every server block and
//! serves until Ctrl+C.
//!
//! ```text
//! gatehouse [CONFIG]
//! ```
//!
//! The configuration path is the first argument, else `GATEHOUSE_CONFIG`, else
//! `gatehouse.toml`. The format follows the file extension (`.toml`, `.yaml`/`.yml`,
//! `.json`).

use anyhow::Context;
use std::path::{Path, PathBuf};
use tokio::signal;
use tracing::{error, info};

use gatehouse::observability::{init_logging, install_exporter};
use gatehouse::{Config, GatewayServer, PluginFactory};

const CONFIG_ENV: &str = "GATEHOUSE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "gatehouse.toml";

fn main() -> anyhow::Result<()> {
    let path = config_path();
    if path.to_str() == Some("--version") {
        println!("gatehouse {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = Config::load(&path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))?;

    init_logging(&config.basic.log_level, config.basic.log_format)?;

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if config.basic.threads > 0 {
        runtime.worker_threads(config.basic.threads);
    }
    let runtime = runtime.build().context("failed to start the tokio runtime")?;

    runtime.block_on(run(config, path))
}

fn config_path() -> PathBuf {
    std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}

async fn run(config: Config, path: PathBuf) -> anyhow::Result<()> {
    info!(
        name = %config.basic.name,
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        "🚀 Starting Gatehouse"
    );
    info!(
        upstreams = config.upstreams.len(),
        locations = config.locations.len(),
        servers = config.servers.len(),
        plugins = config.plugins.len(),
        "📋 Configuration loaded and validated"
    );

    install_exporter(&config.metrics)?;

    if let Some(pid_file) = &config.basic.pid_file {
        write_pid_file(pid_file)?;
    }

    let factory = PluginFactory::with_builtins();
    let server = GatewayServer::bind(&config, &factory).await?;
    let shutdown = server.shutdown_token();

    let mut server_handle = tokio::spawn(server.run());

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for the shutdown signal");
            }
            info!("📡 Received Ctrl+C, initiating graceful shutdown...");
            shutdown.cancel();
            (&mut server_handle).await.context("server task panicked")??;
        }
        result = &mut server_handle => {
            result.context("server task panicked")??;
        }
    }

    if let Some(pid_file) = &config.basic.pid_file {
        let _ = std::fs::remove_file(pid_file);
    }

    info!("✅ Gatehouse shutdown complete");
    Ok(())
}

fn write_pid_file(path: &Path) -> anyhow::Result<()> {
    std::fs::write(path, std::process::id().to_string())
        .with_context(|| format!("failed to write pid file {}", path.display()))?;
    info!(pid_file = %path.display(), "Wrote pid file");
    Ok(())
}
