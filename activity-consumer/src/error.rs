use rdkafka::error::KafkaError;
use thiserror::Error;

use crate::types::Partition;

/// Errors raised while talking to the broker or the consumer group.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker unavailable: {0}")]
    Unavailable(String),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("broker unavailable while fetching: {0}")]
    BrokerUnavailable(String),
    #[error("partition {0} is not assigned to this worker")]
    NotAssigned(Partition),
}

/// Error a processing callback reports for a record.
#[derive(Error, Debug)]
pub enum ProcessingError {
    /// The same record may succeed if tried again.
    #[error("transient processing error: {0:#}")]
    Transient(anyhow::Error),
    /// Trying again cannot help, e.g. the payload does not decode.
    #[error("permanent processing error: {0:#}")]
    Permanent(anyhow::Error),
}

impl ProcessingError {
    pub fn transient(error: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Transient(error.into())
    }

    pub fn permanent(error: impl Into<anyhow::Error>) -> Self {
        ProcessingError::Permanent(error.into())
    }
}

#[derive(Error, Debug)]
pub enum CheckpointError {
    #[error("checkpoint io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("checkpoint file is corrupt: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("cannot commit {partition} at {offset}: only records up to {terminal:?} are terminal")]
    NotTerminal {
        partition: Partition,
        offset: i64,
        terminal: Option<i64>,
    },
    #[error("partition {0} is not tracked")]
    NotTracked(Partition),
    #[error("assignment {generation} of {partition} was superseded")]
    Superseded { partition: Partition, generation: u64 },
    #[error("failed to commit {partition} at {offset} after {attempts} attempts: {source}")]
    Failed {
        partition: Partition,
        offset: i64,
        attempts: u32,
        #[source]
        source: CheckpointError,
    },
}

/// Errors that end `Worker::run`. Everything else is handled inside the loop.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("failed to join the consumer group after {attempts} attempts: {source}")]
    Startup {
        attempts: u32,
        #[source]
        source: BrokerError,
    },
    #[error("failed to load the checkpoint of {partition}: {source}")]
    CheckpointLoad {
        partition: Partition,
        #[source]
        source: CheckpointError,
    },
    #[error("failed to position assigned partitions: {0}")]
    Positioning(#[source] BrokerError),
    #[error("group coordinator closed the event stream")]
    CoordinatorGone,
}
