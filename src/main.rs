use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use shardlimit::config::ShardlimitConfig;
use shardlimit::http::HttpServer;
use shardlimit::ratelimit::Limiter;

/// Token bucket rate limiting service.
#[derive(Debug, Parser)]
#[command(name = "shardlimit", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Starting Shardlimit Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ShardlimitConfig::load(cli.config.as_deref())?;
    info!(
        http_addr = %config.server.http_addr,
        backend = ?config.rate_limiting.backend,
        "Configuration loaded"
    );

    let limiter = Arc::new(Limiter::from_config(&config).await?);
    let server = HttpServer::new(config.server.http_addr, limiter);

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Shardlimit Rate Limiting Service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
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
