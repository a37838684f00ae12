//! event_outbox - outbox relay service
//!
//! Ensures the event store schema exists, then sweeps the outbox on an
//! interval and hands every pending event to the configured transport.

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use event_outbox::jobs::{OutboxSweeper, OutboxSweeperConfig};
use event_outbox::outbox::{ChannelTransport, Envelope, OutboxPublisher};
use event_outbox::{db, Config, PgEventStore};

/// Initialize tracing/logging
fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "event_outbox=debug".into());

    if config.is_production() {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Consume delivered batches. Stands in for a broker client: every batch is
/// logged with its envelope identities.
async fn consume(mut receiver: mpsc::Receiver<Vec<Envelope>>) {
    while let Some(batch) = receiver.recv().await {
        for envelope in &batch {
            tracing::info!(
                message_id = %envelope.message_id,
                aggregate_type = %envelope.aggregate_type,
                aggregate_id = %envelope.aggregate_id,
                version = envelope.version,
                event_type = %envelope.event_type,
                "Event delivered"
            );
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = Config::from_env()?;
    init_tracing(&config);

    tracing::info!("Starting event_outbox relay");
    tracing::info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    db::verify_connection(&pool).await?;
    db::apply_schema(&pool).await?;
    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }

    tracing::info!("Database connected successfully");

    let store = Arc::new(PgEventStore::new(pool.clone()));
    let (transport, receiver) = ChannelTransport::new(config.outbox_batch_size);
    let consumer = tokio::spawn(consume(receiver));

    let publisher = OutboxPublisher::new(store, Arc::new(transport))
        .with_batch_size(config.outbox_batch_size);
    let sweeper = OutboxSweeper::with_config(
        publisher,
        OutboxSweeperConfig {
            sweep_interval: config.outbox_sweep_interval,
        },
    );

    let cancel = CancellationToken::new();
    let sweeper_handle = sweeper.start(cancel.clone());

    shutdown_signal().await;
    cancel.cancel();

    // The sweeper owns the only sender; once it stops the consumer drains
    // what is left and exits.
    sweeper_handle.await?;
    consumer.await?;

    tracing::info!("Relay shutting down...");
    pool.close().await;
    tracing::info!("Database connections closed. Goodbye!");

    Ok(())
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
