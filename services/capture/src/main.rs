use anyhow::{Context, Result};
use capture_service::{
    start_api_server, AppState, CaptureInvoker, CapturePipeline, CaptureScheduler, Config,
    MetadataStore, RetentionEnforcer, RuntimeSettings, SharedSettings, StoragePaths,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    config.validate().context("Invalid configuration")?;

    info!(
        service = %config.service.name,
        interval_seconds = config.capture.interval_seconds,
        images_dir = %config.storage.images_dir.display(),
        "Starting Petcam Capture Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let paths = StoragePaths::from_config(&config.storage);
    paths
        .ensure_dirs()
        .context("Failed to create storage directories")?;

    let metadata_store = Arc::new(
        MetadataStore::new(&config.database)
            .await
            .context("Failed to initialize metadata store")?,
    );

    // Run migrations if enabled
    if config.database.run_migrations {
        metadata_store
            .run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let invoker = CaptureInvoker::new(&config.capture.command_template, config.capture_timeout())
        .context("Invalid capture command template")?;
    let settings = SharedSettings::new(RuntimeSettings::from_config(&config));

    let pipeline = Arc::new(
        CapturePipeline::new(paths.clone(), invoker, metadata_store.clone(), settings)
            .with_thumbnail_bounds(config.thumbnail_bounds()),
    );
    let retention = Arc::new(RetentionEnforcer::new(paths.clone()).with_store(metadata_store));
    let scheduler = CaptureScheduler::new(
        pipeline.clone(),
        retention,
        config.capture.retention_every_cycles,
    );

    let shutdown = CancellationToken::new();

    // Spawn capture loop
    let scheduler_handle = tokio::spawn({
        let token = shutdown.clone();
        async move { scheduler.run(token).await }
    });

    // Spawn API server task; a failed server takes the service down with it
    let api_state = AppState::new(pipeline, &config.api);
    let api_config = config.api.clone();
    let api_handle = tokio::spawn({
        let token = shutdown.clone();
        async move {
            if let Err(e) = start_api_server(api_state, &paths, &api_config, token.clone()).await {
                error!(error = %e, "API server error");
                token.cancel();
            }
        }
    });

    info!("Capture service started successfully");

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = shutdown.cancelled() => {}
    }

    info!("Shutting down capture service");
    shutdown.cancel();

    // An in-flight capture completes before the loop observes the token
    match scheduler_handle.await {
        Ok(cycles) => info!(cycles = cycles, "Capture scheduler finished"),
        Err(e) => error!(error = %e, "Capture scheduler task failed"),
    }
    if let Err(e) = api_handle.await {
        error!(error = %e, "API server task failed");
    }

    info!("Capture service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format.eq_ignore_ascii_case("pretty") {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
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
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
