//! Durable storage of the last committed offset per partition.
//!
//! Offsets stored here are the offset of the last handled record, not the next
//! offset to consume. Stores that speak Kafka's convention translate at the edge.

mod file;
mod memory;

use async_trait::async_trait;

use crate::error::CheckpointError;
use crate::types::Partition;

pub use file::FileCheckpointStore;
pub use memory::MemoryCheckpointStore;

#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// The last durably committed offset, or `None` if the partition was never committed.
    async fn load(&self, partition: &Partition) -> Result<Option<i64>, CheckpointError>;

    /// Durably record that every record up to and including `offset` was handled.
    async fn store(&self, partition: &Partition, offset: i64) -> Result<(), CheckpointError>;
}
