//! Partition Worker - Dedicated task running the fetch, dispatch, commit cycle
//! for a single partition
//!
//! Each assigned partition gets its own task, so:
//! 1. Records of a partition are dispatched one at a time, in offset order
//! 2. Partitions progress independently of each other
//! 3. A slow partition only holds back its own fetches
//!
//! A task belongs to one assignment generation of its partition. Once the
//! partition is assigned again the task stops before its next record, and the
//! offset tracker rejects anything it still tries to mark or commit.

use std::slice;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::coordinator::Broker;
use crate::dispatcher::Dispatcher;
use crate::error::{CommitError, FetchError};
use crate::offset_tracker::OffsetTracker;
use crate::retry::RetryPolicy;
use crate::types::{Outcome, Partition};

#[derive(Debug, Clone)]
pub struct PartitionWorkerConfig {
    pub max_batch_size: usize,
    pub fetch_timeout: Duration,
    /// Backoff while the broker is unreachable. Running tasks never give up.
    pub broker_retry: RetryPolicy,
}

/// Why a partition task stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    /// Rebalance: finish the in-flight batch, commit, stop.
    Drain,
    /// Shutdown: stop at the next record boundary, commit, stop.
    Shutdown,
    /// The partition was assigned again. Stop without committing.
    Superseded,
}

pub struct PartitionWorker {
    partition: Partition,
    drain: CancellationToken,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PartitionWorker {
    pub fn spawn(
        partition: Partition,
        generation: u64,
        broker: Arc<dyn Broker>,
        dispatcher: Dispatcher,
        offset_tracker: Arc<OffsetTracker>,
        config: PartitionWorkerConfig,
    ) -> Self {
        let drain = CancellationToken::new();
        let shutdown = CancellationToken::new();

        let task = PartitionTask {
            partition: partition.clone(),
            generation,
            broker,
            dispatcher,
            offset_tracker,
            config,
            drain: drain.clone(),
            shutdown: shutdown.clone(),
        };
        let handle = tokio::spawn(task.run());

        Self {
            partition,
            drain,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    /// Ask the task to finish its current batch and stop, without waiting.
    pub fn start_drain(&self) {
        self.drain.cancel();
    }

    /// Ask the task to stop after the record in flight, without waiting.
    pub fn start_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for the task to exit. Its terminal progress is committed by then.
    ///
    /// Cancel safe: if the wait is dropped (e.g. on a timeout) the task keeps
    /// running and can be joined again.
    pub async fn join(&mut self) {
        let Some(handle) = self.handle.as_mut() else {
            return;
        };
        let result = handle.await;
        self.handle = None;

        match result {
            Ok(()) => debug!(partition = %self.partition, "Partition worker stopped"),
            Err(e) if e.is_cancelled() => {
                warn!(partition = %self.partition, "Partition worker aborted")
            }
            Err(e) => warn!(
                partition = %self.partition,
                error = %e,
                "Partition worker panicked"
            ),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Cancel the task outright. Only for tasks that ignored shutdown.
    pub fn abort(&self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }

    /// Drain and wait.
    pub async fn drain(mut self) {
        self.start_drain();
        self.join().await;
    }

    /// Shut down and wait.
    pub async fn shutdown(mut self) {
        self.start_shutdown();
        self.join().await;
    }
}

impl Drop for PartitionWorker {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

struct PartitionTask {
    partition: Partition,
    generation: u64,
    broker: Arc<dyn Broker>,
    dispatcher: Dispatcher,
    offset_tracker: Arc<OffsetTracker>,
    config: PartitionWorkerConfig,
    drain: CancellationToken,
    shutdown: CancellationToken,
}

impl PartitionTask {
    fn stop_reason(&self) -> Option<StopReason> {
        if !self
            .offset_tracker
            .is_current(&self.partition, self.generation)
        {
            Some(StopReason::Superseded)
        } else if self.shutdown.is_cancelled() {
            Some(StopReason::Shutdown)
        } else if self.drain.is_cancelled() {
            Some(StopReason::Drain)
        } else {
            None
        }
    }

    async fn run(self) {
        info!(
            partition = %self.partition,
            generation = self.generation,
            "Starting partition worker"
        );

        let reason = self.fetch_loop().await;
        if reason != Some(StopReason::Superseded) {
            self.commit().await;
        }

        info!(
            partition = %self.partition,
            generation = self.generation,
            reason = ?reason,
            committed = ?self.offset_tracker.committed(&self.partition),
            "Partition worker exiting"
        );
    }

    async fn fetch_loop(&self) -> Option<StopReason> {
        let mut unavailable_attempts: u32 = 0;

        loop {
            if let Some(reason) = self.stop_reason() {
                return Some(reason);
            }

            let fetched = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return Some(StopReason::Shutdown),
                _ = self.drain.cancelled() => return Some(StopReason::Drain),
                fetched = self.broker.fetch(
                    slice::from_ref(&self.partition),
                    self.config.max_batch_size,
                    self.config.fetch_timeout,
                ) => fetched,
            };

            let records = match fetched {
                Ok(records) => {
                    unavailable_attempts = 0;
                    records
                }
                Err(FetchError::BrokerUnavailable(reason)) => {
                    unavailable_attempts = unavailable_attempts.saturating_add(1);
                    let wait = self.config.broker_retry.retry_interval(unavailable_attempts);
                    warn!(
                        partition = %self.partition,
                        attempt = unavailable_attempts,
                        reason = %reason,
                        wait_ms = wait.as_millis() as u64,
                        "Broker unavailable, backing off"
                    );

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => return Some(StopReason::Shutdown),
                        _ = self.drain.cancelled() => return Some(StopReason::Drain),
                        _ = tokio::time::sleep(wait) => continue,
                    }
                }
                Err(FetchError::NotAssigned(partition)) => {
                    warn!(partition = %partition, "Partition no longer assigned, stopping");
                    return None;
                }
            };

            if records.is_empty() {
                continue;
            }

            debug!(
                partition = %self.partition,
                batch_size = records.len(),
                first_offset = records.first().map(|r| r.offset()),
                last_offset = records.last().map(|r| r.offset()),
                "Processing batch"
            );

            for record in &records {
                // Drain lets the batch finish. Shutdown only lets the current record finish.
                match self.stop_reason() {
                    Some(StopReason::Superseded) => {
                        debug!(
                            partition = %self.partition,
                            offset = record.offset(),
                            "Partition reassigned, abandoning the batch"
                        );
                        return Some(StopReason::Superseded);
                    }
                    Some(StopReason::Shutdown) => {
                        debug!(
                            partition = %self.partition,
                            offset = record.offset(),
                            "Shutdown requested, leaving the rest of the batch for re-delivery"
                        );
                        break;
                    }
                    Some(StopReason::Drain) | None => {}
                }

                if !self.offset_tracker.mark_dispatched(
                    &self.partition,
                    self.generation,
                    record.offset(),
                ) {
                    continue;
                }

                let dispatched = self.dispatcher.dispatch(record).await;
                debug_assert!(dispatched.outcome != Outcome::Retry);
                self.offset_tracker
                    .mark_terminal(&self.partition, self.generation, record.offset());
            }

            self.commit().await;
        }
    }

    async fn commit(&self) {
        match self
            .offset_tracker
            .commit_terminal(&self.partition, self.generation)
            .await
        {
            Ok(Some(offset)) => {
                debug!(partition = %self.partition, offset = offset, "Batch committed")
            }
            Ok(None) => {}
            Err(CommitError::Superseded { .. }) => {
                debug!(partition = %self.partition, "Partition reassigned, skipping commit")
            }
            Err(CommitError::NotTracked(_)) => {
                debug!(partition = %self.partition, "Partition released, skipping commit")
            }
            Err(e) => error!(
                partition = %self.partition,
                error = %e,
                "Commit failed, progress kept for the next commit"
            ),
        }
    }
}
