//! Relays committed outbox rows to the configured bus until SIGINT/SIGTERM.

use event_bus::outbox::OutboxRelay;
use event_bus::{connect_bus, db, BusConfig, BusMetrics, EventPublisher};
use std::time::Duration;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,event_bus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let cfg = BusConfig::from_env()?;
    let database_url = std::env::var("DATABASE_URL").map_err(|_| "DATABASE_URL must be set")?;
    let poll_ms: u64 = std::env::var("OUTBOX_POLL_MS")
        .unwrap_or_else(|_| "100".to_string())
        .parse()?;
    let batch_size: i64 = std::env::var("OUTBOX_BATCH_SIZE")
        .unwrap_or_else(|_| "100".to_string())
        .parse()?;

    // DB + migrations (fail-fast)
    let pool = db::init_pool(&database_url).await?;
    db::run_migrations(&pool).await?;

    let bus = connect_bus(&cfg).await?;
    let metrics = BusMetrics::new()?;
    let publisher =
        EventPublisher::new(bus, cfg.subject_prefix.clone()).with_metrics(metrics.clone());

    let relay = OutboxRelay::new(pool, publisher)
        .with_batch_size(batch_size)
        .with_poll_interval(Duration::from_millis(poll_ms))
        .with_metrics(metrics);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let relay_task = tokio::spawn(async move { relay.run(shutdown_rx).await });

    shutdown_signal().await;
    tracing::info!("Shutdown requested, finishing current batch");
    shutdown_tx.send(true)?;
    relay_task.await?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
