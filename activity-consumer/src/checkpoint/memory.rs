use async_trait::async_trait;
use dashmap::DashMap;

use super::CheckpointStore;
use crate::error::CheckpointError;
use crate::types::Partition;

/// Process-local checkpoints, for embedding applications that persist progress
/// elsewhere and for tests.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    offsets: DashMap<Partition, i64>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, partition: &Partition) -> Option<i64> {
        self.offsets.get(partition).map(|entry| *entry.value())
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, partition: &Partition) -> Result<Option<i64>, CheckpointError> {
        Ok(self.get(partition))
    }

    async fn store(&self, partition: &Partition, offset: i64) -> Result<(), CheckpointError> {
        self.offsets.insert(partition.clone(), offset);
        Ok(())
    }
}
