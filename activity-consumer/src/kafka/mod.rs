//! Kafka implementation of the broker connection and of broker-native checkpoints.

mod broker;
mod checkpoint;
mod context;

use rdkafka::consumer::StreamConsumer;

pub use broker::{KafkaBroker, KafkaBrokerOptions};
pub use checkpoint::KafkaCheckpointStore;
pub use context::{ActivityConsumerContext, ConnectionStatus};

pub type ActivityConsumer = StreamConsumer<ActivityConsumerContext>;
