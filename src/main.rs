use std::net::SocketAddr;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::{RateLimitSetting, TurnstileConfig};
use turnstile::http::{HttpServer, RateLimitLayer};
use turnstile::registry::Registry;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Serve an HTTP endpoint behind a per-identity rate limiter.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Override the listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Override the rate limit (requests per minute)
    #[arg(long)]
    rate_limit: Option<f64>,

    /// Identify callers by this header instead of their address
    #[arg(long)]
    header: Option<String>,

    /// Log output format
    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match args.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Turnstile");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => TurnstileConfig::load(path)?,
        None => TurnstileConfig::default(),
    };
    if let Some(addr) = args.listen {
        config.server.http_addr = addr;
    }
    if let Some(rate_limit) = args.rate_limit {
        config.limiter.rate_limit = Some(RateLimitSetting::Number(rate_limit));
    }
    if let Some(header) = args.header {
        config.limiter.identity_property = None;
        config.limiter.identity_header = Some(header);
    }
    info!(http_addr = %config.server.http_addr, "Configuration loaded");

    let layer = RateLimitLayer::from_config(&config.limiter, &Registry::new())?;
    info!(identity = %layer.engine().identity(), "Rate limiter initialized");

    let server = HttpServer::new(config.server.http_addr, layer);

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Turnstile stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
