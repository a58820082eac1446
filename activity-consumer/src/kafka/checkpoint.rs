use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer};
use rdkafka::{Offset, TopicPartitionList};

use super::ActivityConsumer;
use crate::checkpoint::CheckpointStore;
use crate::error::CheckpointError;
use crate::types::Partition;

/// Checkpoints kept as the consumer group's committed offsets on the broker.
///
/// Kafka stores the next offset to consume, so stored values are shifted by one
/// on the way in and on the way out.
pub struct KafkaCheckpointStore {
    consumer: Arc<ActivityConsumer>,
    timeout: Duration,
}

impl KafkaCheckpointStore {
    pub fn new(consumer: Arc<ActivityConsumer>, timeout: Duration) -> Self {
        Self { consumer, timeout }
    }
}

fn checkpoint_from_committed(committed: Offset) -> Option<i64> {
    match committed {
        Offset::Offset(next) if next > 0 => Some(next - 1),
        _ => None,
    }
}

fn committed_from_checkpoint(offset: i64) -> Offset {
    Offset::Offset(offset + 1)
}

#[async_trait]
impl CheckpointStore for KafkaCheckpointStore {
    async fn load(&self, partition: &Partition) -> Result<Option<i64>, CheckpointError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(partition.topic(), partition.partition_number());

        let consumer = self.consumer.clone();
        let timeout = self.timeout;
        let committed = tokio::task::spawn_blocking(move || consumer.committed_offsets(tpl, timeout))
            .await
            .map_err(|e| CheckpointError::Unavailable(format!("committed offsets task failed: {e}")))??;

        Ok(committed
            .find_partition(partition.topic(), partition.partition_number())
            .and_then(|elem| checkpoint_from_committed(elem.offset())))
    }

    async fn store(&self, partition: &Partition, offset: i64) -> Result<(), CheckpointError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            committed_from_checkpoint(offset),
        )?;

        let consumer = self.consumer.clone();
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(|e| CheckpointError::Unavailable(format!("commit task failed: {e}")))??;
        Ok(())
    }
}
