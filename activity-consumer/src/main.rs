//! Consume user activity events and hand them to the recommendation pipeline.
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use common_kafka::ConsumerConfigBuilder;
use envconfig::Envconfig;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use activity_consumer::activity::ActivityLogger;
use activity_consumer::checkpoint::{CheckpointStore, FileCheckpointStore};
use activity_consumer::config::{CheckpointStoreKind, Config};
use activity_consumer::health::{HealthRegistry, Readiness};
use activity_consumer::kafka::{KafkaBroker, KafkaCheckpointStore};
use activity_consumer::server::{router, serve, setup_metrics_recorder, setup_metrics_routes};
use activity_consumer::worker::Worker;

const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(10);

async fn wait_for_shutdown_signal() -> Result<()> {
    let mut sigterm = tokio::signal::unix::signal(SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("received SIGINT"),
        _ = sigterm.recv() => info!("received SIGTERM"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::init_from_env().context("Invalid configuration")?;
    info!(
        topic = %config.consumer.kafka_consumer_topic,
        group = %config.consumer.kafka_consumer_group,
        brokers = ?config.kafka.bootstrap_servers(),
        checkpoint_store = ?config.checkpoint_store,
        "Starting activity consumer"
    );

    let client_config = ConsumerConfigBuilder::from_env_config(&config.kafka, &config.consumer).build();
    let broker = Arc::new(
        KafkaBroker::new(
            &client_config,
            config.consumer.kafka_consumer_topic.clone(),
            config.broker_options(),
        )
        .context("Failed to create Kafka consumer")?,
    );

    let checkpoints: Arc<dyn CheckpointStore> = match config.checkpoint_store {
        CheckpointStoreKind::Kafka => {
            Arc::new(KafkaCheckpointStore::new(broker.consumer(), CHECKPOINT_TIMEOUT))
        }
        CheckpointStoreKind::File => Arc::new(
            FileCheckpointStore::open(&config.checkpoint_path)
                .await
                .with_context(|| {
                    format!("Failed to open checkpoint file {}", config.checkpoint_path.display())
                })?,
        ),
    };

    let liveness = HealthRegistry::new("liveness");
    let worker = Worker::new(
        config.worker_config(),
        broker,
        checkpoints,
        Arc::new(ActivityLogger),
    )
    .with_liveness(liveness.register("worker", config.liveness_deadline_ms.0));

    let recorder = setup_metrics_recorder().context("Failed to install metrics recorder")?;
    let app = setup_metrics_routes(router(liveness, Readiness::new(worker.subscribe())), recorder);
    let bind = config.bind();
    let server_handle = tokio::task::spawn(async move {
        if let Err(e) = serve(app, &bind).await {
            error!(error = %e, "failed to start serving metrics");
        }
    });
    info!("Serving health and metrics on {}", config.bind());

    let shutdown = CancellationToken::new();
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Cannot listen for shutdown signals");
            return;
        }
        signal_shutdown.cancel();
    });

    let result = worker.run(shutdown).await;

    server_handle.abort();
    result.context("Activity consumer stopped with an error")
}
