//! Careslot scheduler process.
//!
//! Connects to `PostgreSQL`, applies migrations, exposes Prometheus metrics and
//! runs the reminder dispatcher (which also purges expired slot locks) until
//! Ctrl+C or SIGTERM. Patient contacts are read from the `patient_contacts`
//! table.

use anyhow::Context;
use careslot_core::environment::{Clock, SystemClock};
use careslot_runtime::PeriodicRunner;
use careslot_scheduling::{Config, LoggingNotifier, PostgresBookingStore, metrics};
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Careslot scheduler");

    let metrics_addr: SocketAddr =
        format!("{}:{}", config.server.metrics_host, config.server.metrics_port)
            .parse()
            .context("invalid metrics address")?;
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    metrics::register_metrics();
    info!(%metrics_addr, "Metrics exporter listening");

    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .min_connections(config.database.min_connections)
        .acquire_timeout(Duration::from_secs(config.database.connect_timeout))
        .connect(&config.database.url)
        .await
        .context("failed to connect to database")?;
    let store = PostgresBookingStore::new(pool);
    store.migrate().await.context("failed to apply migrations")?;
    let store = Arc::new(store);
    info!("Database ready");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dispatcher = config.scheduling.reminder_dispatcher(store, Arc::new(LoggingNotifier), clock);

    let handle = PeriodicRunner::new(config.scheduling.reminder_tick()).spawn(Arc::new(dispatcher));
    info!(
        tick_secs = config.scheduling.reminder_tick_secs,
        batch_size = config.scheduling.reminder_batch_size,
        "Reminder dispatcher started"
    );

    shutdown_signal().await?;

    handle
        .shutdown(config.server.shutdown_timeout())
        .await
        .context("reminder dispatcher did not stop in time")?;
    info!("Scheduler stopped");
    Ok(())
}

/// Waits for Ctrl+C (SIGINT) or, on unix, SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C signal, shutting down gracefully...");
            },
            _ = terminate.recv() => {
                info!("Received SIGTERM signal, shutting down gracefully...");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await.context("failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C signal, shutting down gracefully...");
    }

    Ok(())
}
