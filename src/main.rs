use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use bookmark_archiver::archiver::ArchiveService;
use bookmark_archiver::config::{Config, StorageBackend};
use bookmark_archiver::db::Database;
use bookmark_archiver::jobs::JobRunner;
use bookmark_archiver::storage;

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("Fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    init_tracing()?;

    info!("Starting bookmark-archiver");

    let config = Config::from_env().context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    match &config.storage {
        StorageBackend::Local { root } => {
            info!(root = %root.display(), "Using local blob storage");
        }
        StorageBackend::S3 {
            bucket, endpoint, ..
        } => {
            info!(bucket = %bucket, endpoint = ?endpoint, "Using S3 blob storage");
        }
    }

    let db = Database::new(&config.database_path)
        .await
        .context("Failed to initialize database")?;
    info!(path = %config.database_path.display(), "Database initialized");

    let store = storage::from_config(&config).context("Failed to initialize blob storage")?;
    let service = Arc::new(
        ArchiveService::new(&config, db, store).context("Failed to build archive service")?,
    );

    let runner = JobRunner::start(Arc::clone(&service), &config);

    match runner.recover_on_startup().await {
        Ok(count) if count > 0 => info!(count, "Recovered pending bookmarks"),
        Ok(_) => {}
        Err(e) => error!("Failed to recover bookmarks on startup: {e:#}"),
    }

    // Other services mark bookmarks pending; pick them up periodically.
    let shutdown = CancellationToken::new();
    let poller = {
        let shutdown = shutdown.clone();
        let interval = config.poll_interval;
        let runner = &runner;
        async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = runner.enqueue_pending().await {
                            warn!("Failed to queue pending bookmarks: {e:#}");
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
        }
    };

    tokio::join!(poller, async {
        shutdown_signal().await;
        shutdown.cancel();
    });

    info!("Shutting down...");
    runner.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

fn init_tracing() -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,bookmark_archiver=debug"));

    // Check if JSON logging is requested
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| matches!(v.to_lowercase().as_str(), "json" | "structured"))
        .unwrap_or(false);

    if use_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("Failed to initialize tracing")?;
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init()
            .context("Failed to initialize tracing")?;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}
