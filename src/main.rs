use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use turnstile::config::LimiterSettings;
use turnstile::http::HttpServer;
use turnstile::ratelimit::RateLimiter;

/// Per-client HTTP rate limiting service.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Optional YAML file with limiter settings; environment variables win.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address for the HTTP listener.
    #[arg(long, env = "TURNSTILE_LISTEN", default_value = "127.0.0.1:3000")]
    listen: SocketAddr,

    /// Emit logs as JSON lines.
    #[arg(long)]
    log_json: bool,
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
    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("Starting Turnstile rate limiter");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut builder = config::Config::builder();
    if let Some(path) = &args.config {
        builder = builder.add_source(config::File::from(path.as_path()).required(false));
    }
    let source = builder
        .add_source(config::Environment::default())
        .build()?;

    let settings = LimiterSettings::from_source(&source);
    info!(
        mode = ?settings.mode,
        environment = %settings.environment,
        shared = settings.uses_shared_backend(),
        "Configuration loaded"
    );

    let limiter = Arc::new(RateLimiter::new(settings)?);
    limiter.start();

    let server = HttpServer::new(args.listen, limiter.clone());
    let served = server.serve_with_shutdown(shutdown_signal()).await;

    limiter.stop().await;
    served?;

    info!("Turnstile rate limiter stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
