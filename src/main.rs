use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use fingate::config::{Environment, FinGateConfig, LogFormat, LoggingConfig};
use fingate::http::HttpServer;
use fingate::ratelimit::{Gate, ReaperSettings};

/// Per-client rate limiting gate for the personal-finance API.
#[derive(Parser, Debug)]
#[command(name = "fingate", version, about)]
struct Args {
    /// Deployment profile selecting the default settings
    #[arg(short, long, env = "FINGATE_ENV", default_value_t = Environment::Debug)]
    environment: Environment,

    /// YAML configuration file layered over the profile defaults
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = FinGateConfig::load(args.environment, args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    init_tracing(&config.logging);

    info!("Starting fingate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        environment = %args.environment,
        listen_addr = %config.server.listen_addr,
        rate_limiting = config.rate_limiting.enabled,
        rps = config.rate_limiting.requests_per_second,
        burst = config.rate_limiting.burst,
        "Configuration loaded"
    );

    // Initialize the gate and its reaper
    let gate = Arc::new(Gate::new(&config.rate_limiting)?);
    let mut reaper = gate.spawn_reaper(ReaperSettings::from(&config.rate_limiting));

    let server = HttpServer::new(
        config.server.listen_addr,
        Arc::clone(&gate),
        config.rate_limiting.trust_forwarded_headers,
    );

    // Run until a shutdown signal, or until the reaper gives up
    let exit = {
        let reaper_stopped = async {
            match reaper.as_mut() {
                Some(handle) => handle.stopped().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            result = server.serve_with_shutdown(shutdown_signal()) => Exit::Server(result),
            result = reaper_stopped => Exit::Reaper(result),
        }
    };

    match exit {
        Exit::Server(result) => {
            result?;
            if let Some(handle) = reaper.take() {
                handle.shutdown().await?;
            }
        }
        Exit::Reaper(Err(e)) => {
            error!(error = %e, "Rate limiter reaper failed, shutting down");
            return Err(e.into());
        }
        Exit::Reaper(Ok(())) => {
            error!("Rate limiter reaper stopped unexpectedly, shutting down");
            anyhow::bail!("rate limiter reaper stopped unexpectedly");
        }
    }

    info!("fingate stopped");
    Ok(())
}

/// Which half of the process finished first.
enum Exit {
    Server(fingate::error::Result<()>),
    Reaper(fingate::error::Result<()>),
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    match logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init(),
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
