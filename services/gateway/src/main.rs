use anyhow::{Context, Result};
use darkroom_gateway::config::Config;
use darkroom_gateway::gateway::{start_api_server, AppState};
use darkroom_gateway::object_store::S3BlobStore;
use darkroom_gateway::orchestrator::BatchOrchestrator;
use darkroom_gateway::photo_store::PgPhotoStore;
use darkroom_gateway::transform::TransformEngine;
use darkroom_gateway::StaticTokenVerifier;
use std::sync::Arc;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Darkroom ingestion gateway"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // Construct services explicitly; lifecycle is owned here, not by
    // first-use initialization
    let photo_store = Arc::new(
        PgPhotoStore::new(&config.database)
            .await
            .context("Failed to initialize photo store")?,
    );

    if config.database.run_migrations {
        photo_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let blob_store = Arc::new(
        S3BlobStore::new(&config.s3)
            .await
            .context("Failed to initialize blob store")?,
    );

    let transform_engine = Arc::new(TransformEngine::new(&config.pipeline));

    let orchestrator = Arc::new(BatchOrchestrator::new(
        transform_engine,
        blob_store,
        photo_store.clone(),
        config.pipeline.worker_concurrency,
    ));

    let verifier = Arc::new(StaticTokenVerifier::new(&config.auth));

    let state = AppState {
        orchestrator,
        verifier,
        pipeline: config.pipeline.clone(),
        db_pool: photo_store.pool().clone(),
    };

    info!("Ingestion gateway started successfully");

    start_api_server(
        state,
        &config.http,
        config.body_limit_bytes(),
        shutdown_signal(),
    )
    .await?;

    info!("Ingestion gateway stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
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
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
