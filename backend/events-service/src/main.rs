use anyhow::{Context, Result};
use event_store::{create_pool, run_migrations, PostgresEventRepository};
use events_service::broker::{self, JetStreamPublisher, JetStreamSource};
use events_service::config::{Config, SERVICE_NAME};
use events_service::{BatchProcessor, DeadLetterRouter, PipelineMetrics};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    info!("Starting {}", SERVICE_NAME);

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        nats_url = %config.broker.url,
        stream = %config.broker.stream,
        durable = %config.broker.durable_name,
        dlq_stream = %config.broker.dlq_stream,
        batch_size = config.consumer.batch_size,
        concurrency = config.consumer.concurrency,
        "Configuration loaded"
    );

    if (config.store.max_connections as usize) < config.consumer.effective_concurrency() {
        tracing::warn!(
            max_connections = config.store.max_connections,
            concurrency = config.consumer.effective_concurrency(),
            "DB pool is smaller than fallback concurrency; inserts will queue on the pool"
        );
    }

    let pool = create_pool(config.store.clone())
        .await
        .context("Failed to create database pool")?;
    run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;

    let client = broker::connect(&config.broker.url, SERVICE_NAME)
        .await
        .context("Failed to connect to NATS")?;
    let context = async_nats::jetstream::new(client.clone());

    let consumer = broker::ensure_topology(&context, &config.broker, &config.consumer)
        .await
        .context("Failed to set up JetStream stream and consumer")?;

    let metrics = PipelineMetrics::new(prometheus::default_registry());
    let publisher = Arc::new(JetStreamPublisher::new(context));
    let dead_letters = DeadLetterRouter::new(
        publisher,
        config.broker.dlq_subject.clone(),
        config.consumer.max_deliver,
    );

    let processor = Arc::new(BatchProcessor::new(
        Arc::new(JetStreamSource::new(consumer)),
        Arc::new(PostgresEventRepository::new(pool.clone())),
        dead_letters,
        metrics,
        config.consumer.clone(),
    ));

    let runtime = processor.start(CancellationToken::new());

    shutdown_signal().await;

    runtime.stop();
    runtime.join().await;

    if let Err(e) = client.flush().await {
        tracing::warn!(error = %e, "Failed to flush NATS connection");
    }
    pool.close().await;

    info!("{} shutdown complete", SERVICE_NAME);
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,events_service=debug".into());

    let json = std::env::var("LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_target(false))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
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
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }

    info!("Shutting down gracefully...");
}
