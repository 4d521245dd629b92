//! Courier webhook delivery daemon.
//!
//! Builds the delivery service over in-memory storage, runs the queue
//! scheduler and coordinates graceful shutdown.

use std::sync::Arc;

use anyhow::{Context, Result};
use courier_core::{RealClock, Storage};
use courier_delivery::{MemoryDeliveryStorage, QueueScheduler, WebhookDeliveryService};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod config;

use config::Config;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;

    init_tracing(&config.rust_log)?;

    info!(
        delivery_timeout_ms = config.delivery_timeout_ms,
        max_retry_attempts = config.max_retry_attempts,
        failure_threshold = config.circuit_breaker_failure_threshold,
        batch_size = config.scheduler_batch_size,
        "Configuration loaded"
    );

    let clock = RealClock::shared();
    let storage = Arc::new(MemoryDeliveryStorage::new(Storage::new()));
    let service = Arc::new(
        WebhookDeliveryService::new(storage, config.to_service_config(), clock.clone())
            .context("Failed to build delivery service")?,
    );

    let scheduler = Arc::new(QueueScheduler::new(
        Arc::clone(&service),
        config.to_scheduler_config(),
        clock,
    ));

    let token = CancellationToken::new();
    let scheduler_handle = scheduler.spawn(token.clone());

    info!("Courier is ready to deliver webhooks");

    shutdown_signal().await;
    info!("Shutdown signal received, starting graceful shutdown");

    token.cancel();

    match tokio::time::timeout(config.shutdown_timeout(), scheduler_handle).await {
        Ok(Ok(())) => info!("Queue scheduler stopped"),
        Ok(Err(e)) => error!(error = %e, "Queue scheduler task failed"),
        Err(_) => warn!(
            timeout_secs = config.shutdown_timeout_seconds,
            "Shutdown grace period expired"
        ),
    }

    for (key, stats) in service.webhook_delivery_stats().await {
        info!(
            circuit = %key,
            state = %stats.state,
            total_calls = stats.total_calls,
            total_failures = stats.total_failures,
            "Final circuit state"
        );
    }

    info!("Courier shutdown complete");
    Ok(())
}

/// Initializes tracing with the configured filter directives.
fn init_tracing(directives: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_new(directives).context("Invalid RUST_LOG directives")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
    Ok(())
}

/// Waits for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
