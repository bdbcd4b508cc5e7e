// Azion Exporter - Prometheus exporter for Azion Analytics
//
// Polls the Azion Analytics API in the background and serves the latest
// value of every enabled metric on a Prometheus telemetry endpoint.
// Scrapes never wait on the upstream API.
//
// # Features
// - Content Delivery request, bandwidth, data transfer and status code metrics
// - Token authentication with automatic renewal
// - Independent per-metric polling with stale-on-failure snapshots
// - Systemd integration for production deployment
//
// # Usage
// azion-exporter --azion.email <email> --azion.password <password>
//
// Example:
// AZION_EMAIL=ops@example.com AZION_PASSWORD=secret azion-exporter --metrics.interval 60

use anyhow::{Context, Result};
use clap::Parser;
use std::env;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// Module declarations
mod azion;
mod config;
mod exporter;
mod metrics;
mod scheduler;
mod server;
mod storage;

use azion::AzionClient;
use config::{mask_email, Args, ExporterConfig};
use exporter::AnalyticsExporter;
use metrics::MetricRegistry;
use scheduler::PollingScheduler;
use storage::SnapshotStore;

/// Application entry point
///
/// This function:
/// 1. Loads `.env` and parses command-line arguments
/// 2. Initializes logging
/// 3. Builds the metric registry, snapshot store and API client
/// 4. Starts the poller in the background
/// 5. Serves the telemetry endpoint until Ctrl+C or SIGTERM
#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is not an error
    dotenvy::dotenv().ok();

    let args = Args::parse();

    // Logs are written to stdout/stderr and can be captured by systemd
    init_logging();

    info!("=== Azion Exporter Starting ===");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = ExporterConfig::try_from(args).context("Invalid configuration")?;

    info!("Azion account: {}", mask_email(config.credentials.email()));
    info!("Azion API: {}", config.client.base_url);

    let registry = Arc::new(
        MetricRegistry::from_enabled(config.enabled_metrics.as_slice())
            .context("Failed to build the metric registry")?,
    );
    info!(
        "Enabled {} metric(s): {}",
        registry.len(),
        registry.identifiers().collect::<Vec<_>>().join(", ")
    );

    let store = Arc::new(SnapshotStore::new(registry.identifiers()));

    let client = Arc::new(
        AzionClient::new(config.credentials.clone(), config.client.clone())
            .context("Failed to create the Azion API client")?,
    );

    // Authentication failures are retried by every poll, so they are not fatal here
    match client.renew_token().await {
        Ok(token) => {
            info!("Authenticated with the Azion API, token valid until {}", token.expires_at());
            probe_metadata(&client).await;
        }
        Err(e) => warn!("Initial authentication failed: {}", e),
    }

    let prometheus_registry = prometheus::Registry::new();
    prometheus_registry
        .register(Box::new(
            AnalyticsExporter::new(Arc::clone(&registry), Arc::clone(&store))
                .context("Failed to describe exported metrics")?,
        ))
        .context("Failed to register the analytics collector")?;

    let cancel = CancellationToken::new();

    let scheduler = PollingScheduler::new(
        Arc::clone(&registry),
        Arc::clone(&store),
        client,
        config.poll_interval,
    );
    let poller = tokio::spawn(scheduler.run(cancel.clone()));

    tokio::spawn(watch_shutdown_signals(cancel.clone()));

    info!("=== Azion Exporter Started Successfully ===");
    info!("Press Ctrl+C to stop");

    let served = server::serve(
        config.listen_address,
        prometheus_registry,
        &config.telemetry_path,
        cancel.clone(),
    )
    .await;

    // Stop the poller whether the server exited cleanly or not
    cancel.cancel();
    if let Err(e) = poller.await {
        error!("Poller task failed: {}", e);
    }

    served.with_context(|| format!("HTTP server on {} failed", config.listen_address))?;

    info!("=== Azion Exporter Stopped ===");
    Ok(())
}

/// Logs the metrics the account can query
///
/// Failures are only logged: polling reports its own errors per metric.
async fn probe_metadata(client: &AzionClient) {
    match client.metadata().await {
        Ok(metadata) => {
            let names: Vec<&str> = metadata.metric_names().collect();
            info!("Analytics API reachable, {} dimension group(s) available", names.len());
        }
        Err(e) => warn!("Analytics metadata probe failed: {}", e),
    }
}

/// Cancels `cancel` on Ctrl+C or SIGTERM
async fn watch_shutdown_signals(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }

    cancel.cancel();
}

/// Initializes the logging subsystem
///
/// Sets up structured logging with:
/// - Timestamp for each log entry
/// - Log level (INFO, WARN, ERROR, etc.)
/// - Target module name
/// - Colored output when running in terminal
/// - JSON output when running as systemd service
///
/// # Log Levels
/// Default: INFO
/// Can be overridden with RUST_LOG environment variable
///
/// # Examples
/// ```bash
/// RUST_LOG=debug azion-exporter ...                 # Enable debug logging
/// RUST_LOG=azion_exporter::azion=debug azion-exporter ...  # Only API client details
/// ```
fn init_logging() {
    // Systemd sets INVOCATION_ID environment variable
    let is_systemd = env::var("INVOCATION_ID").is_ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if is_systemd {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_ansi(true),
            )
            .init();
    }
}
