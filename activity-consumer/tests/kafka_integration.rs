//! Runs the worker against a real broker on localhost:9092.
//!
//! `cargo test -- --ignored` with a local Kafka up, e.g. from docker compose.

use std::sync::Arc;
use std::time::Duration;

use activity_consumer::checkpoint::{CheckpointStore, FileCheckpointStore};
use activity_consumer::kafka::{KafkaBroker, KafkaBrokerOptions, KafkaCheckpointStore};
use activity_consumer::retry::RetryPolicy;
use activity_consumer::test_utils::{eventually, ScriptedProcessor, Step};
use activity_consumer::types::{OffsetReset, Partition, WorkerState};
use activity_consumer::worker::{Worker, WorkerConfig};
use anyhow::Result;
use common_kafka::ConsumerConfigBuilder;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use tokio_util::sync::CancellationToken;

const KAFKA_BROKERS: &str = "localhost:9092";
const TEST_TOPIC: &str = "activity-consumer-integration-test";
const WAIT: Duration = Duration::from_secs(30);

async fn send_activity(topic: &str, count: usize) -> Result<()> {
    let producer: FutureProducer = ClientConfig::new()
        .set("bootstrap.servers", KAFKA_BROKERS)
        .set("message.timeout.ms", "5000")
        .create()?;

    for i in 0..count {
        let key = format!("user-{i}");
        let payload = format!(r#"{{"user_id":"{key}","action":"view","item_id":"item-{i}"}}"#);
        let record = FutureRecord::to(topic).partition(0).key(&key).payload(&payload);

        producer
            .send(record, Timeout::After(Duration::from_secs(5)))
            .await
            .map_err(|(e, _)| anyhow::anyhow!("Failed to send message: {}", e))?;
    }
    Ok(())
}

fn create_broker(topic: &str, group_id: &str) -> Result<Arc<KafkaBroker>> {
    create_broker_with(topic, group_id, OffsetReset::Earliest, false)
}

fn create_broker_with(
    topic: &str,
    group_id: &str,
    offset_reset: OffsetReset,
    position_on_assign: bool,
) -> Result<Arc<KafkaBroker>> {
    let client_config = ConsumerConfigBuilder::for_consumer_group(KAFKA_BROKERS, group_id)
        .with_offset_reset(offset_reset)
        .with_session_timeout_ms(6000)
        .with_heartbeat_interval_ms(2000)
        .build();

    let options = KafkaBrokerOptions {
        rebalance_drain_timeout: Duration::from_secs(5),
        position_on_assign,
        ..KafkaBrokerOptions::default()
    };
    Ok(Arc::new(KafkaBroker::new(&client_config, topic, options)?))
}

fn integration_config(offset_reset: OffsetReset) -> WorkerConfig {
    WorkerConfig {
        offset_reset,
        fetch_timeout: Duration::from_millis(100),
        record_retry: RetryPolicy::immediate(),
        shutdown_timeout: Duration::from_secs(5),
        ..WorkerConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires a Kafka broker on localhost:9092"]
async fn test_worker_processes_and_commits_activity() -> Result<()> {
    let topic = format!("{}-{}", TEST_TOPIC, uuid::Uuid::new_v4());
    let group_id = format!("test-group-{}", uuid::Uuid::new_v4());
    send_activity(&topic, 5).await?;

    let broker = create_broker(&topic, &group_id)?;
    let checkpoints = Arc::new(KafkaCheckpointStore::new(
        broker.consumer(),
        Duration::from_secs(5),
    ));
    let processor = Arc::new(ScriptedProcessor::new());
    processor.script(0, 2, vec![Step::Transient]);

    let config = integration_config(OffsetReset::Earliest);
    let worker = Worker::new(config, broker.clone(), checkpoints.clone(), processor.clone());
    let state = worker.subscribe();

    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    assert!(eventually(|| processor.processed(0).len() == 5, WAIT).await);
    assert_eq!(processor.processed(0), vec![0, 1, 2, 3, 4]);
    assert_eq!(processor.invocations(0, 2), 2);

    shutdown.cancel();
    handle.await??;
    assert_eq!(*state.borrow(), WorkerState::Stopped);

    let partition = Partition::new(topic.as_str(), 0);
    assert_eq!(checkpoints.load(&partition).await?, Some(4));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires a Kafka broker on localhost:9092"]
async fn test_file_checkpoints_position_the_consumer_on_assignment() -> Result<()> {
    let topic = format!("{}-{}", TEST_TOPIC, uuid::Uuid::new_v4());
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("checkpoints.json");
    let partition = Partition::new(topic.as_str(), 0);
    send_activity(&topic, 3).await?;

    let first = Arc::new(ScriptedProcessor::new());
    let group_id = format!("test-group-{}", uuid::Uuid::new_v4());
    let broker = create_broker_with(&topic, &group_id, OffsetReset::Earliest, true)?;
    let checkpoints = Arc::new(FileCheckpointStore::open(&path).await?);
    let worker = Worker::new(
        integration_config(OffsetReset::Earliest),
        broker,
        checkpoints.clone(),
        first.clone(),
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    assert!(eventually(|| first.processed(0).len() == 3, WAIT).await);
    shutdown.cancel();
    handle.await??;
    assert_eq!(checkpoints.load(&partition).await?, Some(2));

    send_activity(&topic, 2).await?;

    // A fresh group starting at the log end only sees the new records if the
    // file checkpoint moved the consumer
    let second = Arc::new(ScriptedProcessor::new());
    let group_id = format!("test-group-{}", uuid::Uuid::new_v4());
    let broker = create_broker_with(&topic, &group_id, OffsetReset::Latest, true)?;
    let checkpoints = Arc::new(FileCheckpointStore::open(&path).await?);
    let worker = Worker::new(
        integration_config(OffsetReset::Latest),
        broker,
        checkpoints.clone(),
        second.clone(),
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    assert!(eventually(|| second.processed(0).len() == 2, WAIT).await);
    shutdown.cancel();
    handle.await??;

    assert_eq!(second.processed(0), vec![3, 4]);
    assert_eq!(checkpoints.load(&partition).await?, Some(4));
    Ok(())
}
