//! SIWA verification server.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use siwa::config::SiwaConfig;
use siwa::server::start_server;
use siwa::service::SiwaService;

#[derive(Debug, Parser)]
#[command(name = "siwa", version, about = "Sign-In-With-Agent verification server")]
struct Cli {
    /// TOML config file (defaults to ~/.siwa/config.toml when present)
    #[arg(long, env = "SIWA_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address; overrides SIWA_BIND and the config file
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "siwa=info,tower_http=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    tracing::info!("Starting SIWA server v{}", env!("CARGO_PKG_VERSION"));

    let config = SiwaConfig::from_env_with_toml(cli.config.as_deref())
        .context("failed to load configuration")?;
    let bind = cli.bind.unwrap_or(config.bind);
    let service =
        Arc::new(SiwaService::from_config(&config).context("failed to build SIWA service")?);

    let server = start_server(bind, service)
        .await
        .context("failed to start HTTP server")?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");
    server.shutdown().await;
    Ok(())
}
