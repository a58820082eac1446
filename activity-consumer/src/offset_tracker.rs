//! Offset Tracker - Tracks dispatch and commit progress per partition
//!
//! For every owned partition the tracker keeps three watermarks:
//! - `dispatched`: the highest offset handed to the dispatcher
//! - `terminal`: the highest offset whose record (and every record before it)
//!   reached Success or Skip
//! - `committed`: the highest offset durably written to the checkpoint store
//!
//! `committed <= terminal <= dispatched` always holds, and `committed` never goes
//! backwards. A failed commit leaves `terminal` in place, so the next commit for
//! the partition writes the progress again.
//!
//! Every assignment of a partition starts a new generation. Updates carry the
//! generation they were made for, so a task left over from an earlier assignment
//! can neither mark nor commit once the partition was assigned again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::error::{CheckpointError, CommitError};
use crate::metrics_consts::{
    DUPLICATE_RECORDS_DROPPED, OFFSET_COMMITS, PARTITION_LAST_COMMITTED_OFFSET,
};
use crate::retry::RetryPolicy;
use crate::types::Partition;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PartitionState {
    generation: u64,
    dispatched: Option<i64>,
    terminal: Option<i64>,
    committed: Option<i64>,
}

pub struct OffsetTracker {
    store: Arc<dyn CheckpointStore>,
    retry_policy: RetryPolicy,
    /// Store retries after the first failed attempt of a commit
    max_retries: u32,
    partitions: DashMap<Partition, PartitionState>,
    next_generation: AtomicU64,
}

impl OffsetTracker {
    pub fn new(store: Arc<dyn CheckpointStore>, retry_policy: RetryPolicy, max_retries: u32) -> Self {
        Self {
            store,
            retry_policy,
            max_retries,
            partitions: DashMap::new(),
            next_generation: AtomicU64::new(1),
        }
    }

    /// The last durably committed offset, read from the checkpoint store.
    pub async fn last_committed(&self, partition: &Partition) -> Result<Option<i64>, CheckpointError> {
        self.store.load(partition).await
    }

    /// Start tracking a freshly assigned partition from its last committed offset.
    ///
    /// Records at or below that offset were already handled and will be dropped
    /// if the broker delivers them again. Returns the generation of this assignment.
    pub fn assign(&self, partition: &Partition, last_committed: Option<i64>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        info!(
            partition = %partition,
            generation = generation,
            last_committed = ?last_committed,
            "Tracking offsets for assigned partition"
        );
        self.partitions.insert(
            partition.clone(),
            PartitionState {
                generation,
                dispatched: last_committed,
                terminal: last_committed,
                committed: last_committed,
            },
        );
        generation
    }

    /// Whether `generation` is still the live assignment of the partition.
    pub fn is_current(&self, partition: &Partition, generation: u64) -> bool {
        self.partitions
            .get(partition)
            .is_some_and(|state| state.generation == generation)
    }

    /// Record that `offset` is about to be dispatched.
    ///
    /// Returns false, and leaves the state untouched, when the offset does not
    /// strictly follow the last dispatched one or the generation is superseded.
    /// Such records must not be dispatched.
    pub fn mark_dispatched(&self, partition: &Partition, generation: u64, offset: i64) -> bool {
        let Some(mut state) = self.partitions.get_mut(partition) else {
            warn!(partition = %partition, offset = offset, "Dispatch on untracked partition");
            return false;
        };

        if state.generation != generation {
            warn!(
                partition = %partition,
                offset = offset,
                generation = generation,
                current_generation = state.generation,
                "Dispatch from a superseded assignment"
            );
            return false;
        }

        if state.dispatched.is_some_and(|last| offset <= last) {
            debug!(
                partition = %partition,
                offset = offset,
                last_dispatched = ?state.dispatched,
                "Dropping duplicate or out of order record"
            );
            metrics::counter!(
                DUPLICATE_RECORDS_DROPPED,
                "topic" => partition.topic().to_string(),
                "partition" => partition.partition_number().to_string()
            )
            .increment(1);
            return false;
        }

        state.dispatched = Some(offset);
        true
    }

    /// Record that the dispatched record at `offset` reached Success or Skip.
    pub fn mark_terminal(&self, partition: &Partition, generation: u64, offset: i64) {
        let Some(mut state) = self.partitions.get_mut(partition) else {
            warn!(partition = %partition, offset = offset, "Terminal outcome on untracked partition");
            return;
        };

        if state.generation != generation {
            warn!(
                partition = %partition,
                offset = offset,
                generation = generation,
                "Ignoring terminal outcome from a superseded assignment"
            );
            return;
        }

        if state.dispatched.map_or(true, |dispatched| offset > dispatched) {
            warn!(
                partition = %partition,
                offset = offset,
                last_dispatched = ?state.dispatched,
                "Ignoring terminal outcome for an offset that was never dispatched"
            );
            return;
        }

        if state.terminal.map_or(true, |terminal| offset > terminal) {
            state.terminal = Some(offset);
        }
    }

    /// Persist that every record up to and including `offset` was handled.
    ///
    /// Returns `Ok(true)` when something was written and `Ok(false)` when the
    /// checkpoint is already at or past `offset`.
    pub async fn commit(&self, partition: &Partition, offset: i64) -> Result<bool, CommitError> {
        self.commit_for(partition, None, offset).await
    }

    async fn commit_for(
        &self,
        partition: &Partition,
        generation: Option<u64>,
        offset: i64,
    ) -> Result<bool, CommitError> {
        let state = self
            .partitions
            .get(partition)
            .map(|entry| *entry.value())
            .ok_or_else(|| CommitError::NotTracked(partition.clone()))?;

        if let Some(generation) = generation.filter(|g| *g != state.generation) {
            return Err(CommitError::Superseded {
                partition: partition.clone(),
                generation,
            });
        }

        if state.terminal.map_or(true, |terminal| offset > terminal) {
            return Err(CommitError::NotTerminal {
                partition: partition.clone(),
                offset,
                terminal: state.terminal,
            });
        }

        if state.committed.is_some_and(|committed| offset <= committed) {
            return Ok(false);
        }

        let mut attempt = 0;
        loop {
            attempt += 1;

            match self.store.store(partition, offset).await {
                Ok(()) => {
                    self.advance_committed(partition, state.generation, offset);
                    metrics::counter!(OFFSET_COMMITS, "status" => "success").increment(1);
                    debug!(partition = %partition, offset = offset, "Committed offset");
                    return Ok(true);
                }
                Err(e) => {
                    metrics::counter!(OFFSET_COMMITS, "status" => "failure").increment(1);
                    warn!(
                        partition = %partition,
                        offset = offset,
                        attempt = attempt,
                        error = ?e,
                        "Failed to commit offset"
                    );

                    if attempt > self.max_retries {
                        return Err(CommitError::Failed {
                            partition: partition.clone(),
                            offset,
                            attempts: attempt,
                            source: e,
                        });
                    }

                    tokio::time::sleep(self.retry_policy.retry_interval(attempt)).await;
                }
            }
        }
    }

    /// Commit everything that reached a terminal outcome so far.
    ///
    /// Returns the offset written, or `None` if there was nothing new to commit.
    pub async fn commit_terminal(
        &self,
        partition: &Partition,
        generation: u64,
    ) -> Result<Option<i64>, CommitError> {
        let terminal = self
            .partitions
            .get(partition)
            .map(|entry| entry.value().terminal)
            .ok_or_else(|| CommitError::NotTracked(partition.clone()))?;

        match terminal {
            Some(offset) => Ok(self
                .commit_for(partition, Some(generation), offset)
                .await?
                .then_some(offset)),
            None => Ok(None),
        }
    }

    fn advance_committed(&self, partition: &Partition, generation: u64, offset: i64) {
        if let Some(mut state) = self.partitions.get_mut(partition) {
            if state.generation != generation {
                return;
            }
            if state.committed.map_or(true, |committed| offset > committed) {
                state.committed = Some(offset);
                metrics::gauge!(
                    PARTITION_LAST_COMMITTED_OFFSET,
                    "topic" => partition.topic().to_string(),
                    "partition" => partition.partition_number().to_string()
                )
                .set(offset as f64);
            }
        }
    }

    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).and_then(|s| s.committed)
    }

    pub fn terminal(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).and_then(|s| s.terminal)
    }

    pub fn dispatched(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).and_then(|s| s.dispatched)
    }

    /// Stop tracking a revoked partition. Its progress should have been committed.
    pub fn release(&self, partition: &Partition) {
        if let Some((_, state)) = self.partitions.remove(partition) {
            if state.terminal != state.committed {
                warn!(
                    partition = %partition,
                    terminal = ?state.terminal,
                    committed = ?state.committed,
                    "Released partition with uncommitted progress, records will be re-delivered"
                );
            }
        }
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}
