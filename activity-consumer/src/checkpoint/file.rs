use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::CheckpointStore;
use crate::error::CheckpointError;
use crate::types::Partition;

/// Local key-value checkpoint file: a JSON object mapping `"topic/partition"` to
/// the last committed offset.
///
/// Every store rewrites the whole file through a temporary sibling and an atomic
/// rename, so a crash leaves either the previous or the new content on disk.
pub struct FileCheckpointStore {
    path: PathBuf,
    offsets: Mutex<BTreeMap<String, i64>>,
}

impl FileCheckpointStore {
    /// Open the checkpoint file, starting empty if it does not exist yet.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();

        let offsets = match tokio::fs::read(&path).await {
            Ok(contents) => serde_json::from_slice(&contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                BTreeMap::new()
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            path = %path.display(),
            partitions = offsets.len(),
            "Opened checkpoint file"
        );

        Ok(Self {
            path,
            offsets: Mutex::new(offsets),
        })
    }

    fn key(partition: &Partition) -> String {
        format!("{}/{}", partition.topic(), partition.partition_number())
    }

    async fn persist(&self, offsets: &BTreeMap<String, i64>) -> Result<(), CheckpointError> {
        let contents = serde_json::to_vec_pretty(offsets)?;
        let tmp_path = self.path.with_extension("tmp");

        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(&contents).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&tmp_path, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for FileCheckpointStore {
    async fn load(&self, partition: &Partition) -> Result<Option<i64>, CheckpointError> {
        let offsets = self.offsets.lock().await;
        Ok(offsets.get(&Self::key(partition)).copied())
    }

    async fn store(&self, partition: &Partition, offset: i64) -> Result<(), CheckpointError> {
        let mut offsets = self.offsets.lock().await;

        let mut updated = offsets.clone();
        updated.insert(Self::key(partition), offset);
        self.persist(&updated).await?;

        // Only visible once it is on disk
        *offsets = updated;
        debug!(partition = %partition, offset = offset, "Checkpoint written");
        Ok(())
    }
}
