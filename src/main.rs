use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::config::{LoggingConfig, StoreBackend, TollgateConfig};
use tollgate::http::HttpServer;
use tollgate::ratelimit::{ExpirySweeper, RateLimiter};
use tollgate::store::{build_store, PgRequestStore};

#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about = "Shared-store sliding-window rate limiter")]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the decision service (default)
    Serve,
    /// Delete expired records once and exit; meant for an external scheduler
    Sweep,
    /// Create the store schema and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = TollgateConfig::load(cli.config.as_deref())?;

    init_tracing(&config.logging);

    info!("Starting Tollgate");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Sweep => sweep_once(config).await,
        Command::Migrate => migrate(config).await,
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(config: TollgateConfig) -> anyhow::Result<()> {
    let policies = config.policy_registry()?;
    info!(
        listen_addr = %config.server.listen_addr,
        categories = policies.len(),
        "Configuration loaded"
    );

    let store = build_store(&config.store).await?;

    let rate_limiter = Arc::new(
        RateLimiter::new(store.clone(), policies)
            .with_timeouts(config.store.query_timeout(), config.store.write_timeout()),
    );
    info!("Rate limiter initialized");

    // One shutdown signal fans out to the server and the sweeper.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper_task = config.sweeper.interval_secs.map(|secs| {
        let sweeper = ExpirySweeper::new(store.clone()).with_batch_size(config.sweeper.batch_size);
        let mut stop = shutdown_rx.clone();
        tokio::spawn(async move {
            sweeper
                .run_periodic(Duration::from_secs(secs), async move {
                    let _ = stop.changed().await;
                })
                .await;
        })
    });
    if sweeper_task.is_none() {
        info!("In-process sweeper disabled; schedule `tollgate sweep` externally");
    }

    let server = HttpServer::new(config.server.listen_addr, rate_limiter);
    let mut server_stop = shutdown_rx.clone();
    let server_task = tokio::spawn(server.serve_with_shutdown(async move {
        let _ = server_stop.changed().await;
    }));

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    server_task.await??;
    if let Some(task) = sweeper_task {
        task.await?;
    }

    info!("Tollgate stopped");
    Ok(())
}

async fn sweep_once(config: TollgateConfig) -> anyhow::Result<()> {
    ensure_shared_store(&config, "sweep")?;

    let store = build_store(&config.store).await?;
    let sweeper = ExpirySweeper::new(store).with_batch_size(config.sweeper.batch_size);
    let deleted = sweeper.sweep().await?;

    info!(deleted = deleted, "Sweep finished");
    Ok(())
}

/// One-shot commands only make sense against the shared store; a fresh
/// in-memory store is always empty.
fn ensure_shared_store(config: &TollgateConfig, command: &str) -> anyhow::Result<()> {
    if config.store.backend == StoreBackend::Memory {
        anyhow::bail!("`tollgate {}` requires store.backend: postgres", command);
    }
    Ok(())
}

async fn migrate(config: TollgateConfig) -> anyhow::Result<()> {
    ensure_shared_store(&config, "migrate")?;

    let url = config
        .store
        .database_url
        .as_deref()
        .ok_or_else(|| anyhow::anyhow!("store.database_url is required for migrate"))?;

    let store =
        PgRequestStore::connect(url, config.store.max_connections, config.store.query_timeout())
            .await?;
    store.migrate().await?;
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
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
