use std::time::Duration;

use async_trait::async_trait;

use crate::error::FetchError;
use crate::types::{Partition, Record};

/// Pulls bounded batches of records for assigned partitions.
///
/// Implementations wait up to `timeout` for at least one record and return an
/// empty batch when nothing arrived, which is not an error. A batch never holds
/// more than `max_batch_size` records, and the records of one partition come in
/// offset order.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch(
        &self,
        partitions: &[Partition],
        max_batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, FetchError>;
}
