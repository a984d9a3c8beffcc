//! Camera streaming server CLI

// Use jemalloc for better memory management (optional feature)
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use camstream::config::Config;
use camstream::http::WebServer;
use camstream::StreamComponent;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "camstream")]
#[command(about = "MJPEG streaming over RTSP and HTTP for camera boards")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    fmt().with_env_filter(filter).with_target(false).init();

    info!("camstream starting");
    info!(config_path = %cli.config, "Loading configuration");

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config))?;

    if !config.stream.enabled {
        info!("Streaming is disabled in configuration");
        return Ok(());
    }

    let web = WebServer::new(config.http.bind.clone(), config.http.port);
    let serve_http = config.http.enabled;

    let component = StreamComponent::setup(config, &web)
        .await
        .context("failed to start streaming")?;

    if serve_http {
        let addr = web.start().await.context("failed to start web server")?;
        info!(addr = %addr, "HTTP endpoints ready");
    }

    // Wait for Ctrl+C
    info!("Streaming started, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    web.stop().await;
    component.shutdown().await;

    Ok(())
}
