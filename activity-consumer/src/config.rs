use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use common_kafka::{ConsumerConfig, KafkaConfig};
use envconfig::Envconfig;

use crate::kafka::KafkaBrokerOptions;
use crate::retry::RetryPolicy;
use crate::worker::WorkerConfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    #[envconfig(default = "activity-consumer")]
    pub worker_name: String,

    #[envconfig(default = "500")]
    pub max_batch_size: usize,

    #[envconfig(default = "1000")]
    pub fetch_timeout_ms: EnvMsDuration,

    #[envconfig(default = "3")]
    pub max_attempts: u32,

    #[envconfig(default = "100")]
    pub record_retry_initial_ms: EnvMsDuration,

    #[envconfig(default = "5000")]
    pub record_retry_max_ms: EnvMsDuration,

    #[envconfig(default = "200")]
    pub broker_retry_initial_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub broker_retry_max_ms: EnvMsDuration,

    #[envconfig(default = "10")]
    pub startup_max_retries: u32,

    #[envconfig(default = "5")]
    pub commit_max_retries: u32,

    #[envconfig(default = "30000")]
    pub rebalance_drain_timeout_ms: EnvMsDuration,

    #[envconfig(default = "30000")]
    pub shutdown_timeout_ms: EnvMsDuration,

    #[envconfig(default = "1000")]
    pub partition_buffer_size: usize,

    #[envconfig(default = "kafka")]
    pub checkpoint_store: CheckpointStoreKind,

    #[envconfig(default = "./checkpoints/offsets.json")]
    pub checkpoint_path: PathBuf,

    #[envconfig(default = "30000")]
    pub liveness_deadline_ms: EnvMsDuration,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(nested = true)]
    pub consumer: ConsumerConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn worker_config(&self) -> WorkerConfig {
        WorkerConfig {
            member_id: self.worker_name.clone(),
            offset_reset: self.consumer.kafka_consumer_offset_reset,
            max_batch_size: self.max_batch_size,
            fetch_timeout: self.fetch_timeout_ms.0,
            max_attempts: self.max_attempts,
            record_retry: RetryPolicy::new(
                self.record_retry_initial_ms.0,
                self.record_retry_max_ms.0,
            ),
            broker_retry: RetryPolicy::new(
                self.broker_retry_initial_ms.0,
                self.broker_retry_max_ms.0,
            ),
            startup_max_retries: self.startup_max_retries,
            commit_max_retries: self.commit_max_retries,
            rebalance_drain_timeout: self.rebalance_drain_timeout_ms.0,
            shutdown_timeout: self.shutdown_timeout_ms.0,
        }
    }

    pub fn broker_options(&self) -> KafkaBrokerOptions {
        KafkaBrokerOptions {
            partition_buffer_size: self.partition_buffer_size,
            rebalance_drain_timeout: self.rebalance_drain_timeout_ms.0,
            // Group offsets already point past the checkpoint when Kafka stores it
            position_on_assign: self.checkpoint_store != CheckpointStoreKind::Kafka,
            ..KafkaBrokerOptions::default()
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Where committed offsets are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointStoreKind {
    /// The consumer group's offsets on the broker
    Kafka,
    /// A local JSON file
    File,
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseCheckpointStoreKindError(String);

impl FromStr for CheckpointStoreKind {
    type Err = ParseCheckpointStoreKindError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "kafka" => Ok(CheckpointStoreKind::Kafka),
            "file" => Ok(CheckpointStoreKind::File),
            _ => Err(ParseCheckpointStoreKindError(s.to_owned())),
        }
    }
}
