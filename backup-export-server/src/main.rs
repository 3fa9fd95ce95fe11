//! Backup export server - Intake API and job consumer.

mod config;
mod db;
mod error;
mod models;
mod routes;
mod services;
mod state;

use crate::config::AppConfig;
use crate::db::connection::create_pool;
use crate::db::migrate::migrate;
use crate::services::consumer::JobConsumer;
use crate::state::{AppState, Storage};
use backup_export::notify::EmailNotifier;
use backup_export::utils::logger;
use backup_export::BackupPipeline;
use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Serve the API and consume jobs
    All,
    /// Serve the API only
    Intake,
    /// Consume jobs only
    Worker,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on (overrides PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Which parts of the service to run
    #[arg(short, long, value_enum, default_value_t = Mode::All)]
    mode: Mode,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AppConfig::from_env()?;
    if let Some(port) = args.port {
        config.port = port;
    }

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log_level);
    logger::init(log_level)?;
    routes::health::init_start_time();

    tracing::info!(
        "Starting backup-export-server v{} ({:?} mode, worker_id: {})",
        env!("CARGO_PKG_VERSION"),
        args.mode,
        config.worker_id
    );

    // Ensure data directories exist
    std::fs::create_dir_all(&config.data_dir)?;
    if config.storage_backend == config::StorageBackend::Local {
        std::fs::create_dir_all(&config.storage_root)?;
    }

    // Initialize database
    let db_path = config.db_path.to_string_lossy().to_string();
    let pool = create_pool(&db_path)?;
    migrate(&pool, &config.data_dir)?;

    let storage = Storage::connect(&config).await?;
    tracing::info!(
        "Object store: {:?}, section source: {:?}",
        config.storage_backend,
        config.source_backend
    );

    let state = Arc::new(AppState::new(pool, config, storage));
    let config = &state.config;
    let cancel = CancellationToken::new();

    // Start the job consumer
    let consumer = if args.mode != Mode::Intake {
        let pipeline = BackupPipeline::new(
            state.store.object_store(),
            config.record_source(),
            Arc::new(EmailNotifier::new(config.email_settings()?)),
            config.pipeline_config(),
        );
        let consumer = JobConsumer::new(
            state.db.clone(),
            state.queue.clone(),
            Arc::new(pipeline),
            config.worker_id.clone(),
            config.poll_interval(),
            config.stale_lease(),
        );
        Some(consumer.spawn(cancel.clone()))
    } else {
        None
    };

    if args.mode == Mode::Worker {
        shutdown_signal(cancel.clone()).await;
    } else {
        // Build router
        let app = routes::create_router(state.clone());

        // Start HTTP server
        let addr = format!("0.0.0.0:{}", config.port);
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!("Listening on {}", addr);

        // Graceful shutdown
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal(cancel.clone()))
            .await?;
    }

    // Cleanup
    tracing::info!("Shutting down...");
    cancel.cancel();

    // The consumer finishes the job it is running before it stops
    if let Some(handle) = consumer {
        if let Err(e) = handle.await {
            tracing::warn!("Job consumer ended abnormally: {}", e);
        }
    }

    // Close database
    db::connection::close_pool(&state.db);
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl+c: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT"),
        _ = terminate => tracing::info!("Received SIGTERM"),
    }

    cancel.cancel();
}
