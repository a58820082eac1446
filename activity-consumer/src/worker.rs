//! Worker - drives group membership and one partition worker per owned partition
//!
//! ```text
//! Starting -> Assigning -> Running -> Rebalancing -> Running | Stopping -> Stopped
//! ```
//!
//! Errors while starting or assigning end [`Worker::run`]. Once running, failures
//! are handled per record and per partition and never stop the worker.
//!
//! A partition worker that misses the drain deadline is told to shut down and
//! kept aside. The partition is not handed to a new worker before that one exited.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::coordinator::{Broker, RebalanceEvent};
use crate::dispatcher::{Dispatcher, RecordProcessor};
use crate::error::WorkerError;
use crate::health::HealthHandle;
use crate::metrics_consts::{ASSIGNED_PARTITIONS, REBALANCE_EVENTS, WORKER_STATE_TRANSITIONS};
use crate::offset_tracker::OffsetTracker;
use crate::partition_worker::{PartitionWorker, PartitionWorkerConfig};
use crate::retry::RetryPolicy;
use crate::types::{OffsetReset, Partition, PartitionAssignment, StartPosition, WorkerState};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifies this instance in logs and in its partition assignment
    pub member_id: String,
    /// Where to start a partition that was never committed
    pub offset_reset: OffsetReset,
    pub max_batch_size: usize,
    pub fetch_timeout: Duration,
    /// Callback invocations per record before it is skipped as poison
    pub max_attempts: u32,
    pub record_retry: RetryPolicy,
    pub broker_retry: RetryPolicy,
    /// Retries after the first failed connect or checkpoint load
    pub startup_max_retries: u32,
    /// Store retries after the first failed attempt of a commit
    pub commit_max_retries: u32,
    pub rebalance_drain_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            member_id: "activity-consumer".to_string(),
            offset_reset: OffsetReset::Earliest,
            max_batch_size: 500,
            fetch_timeout: Duration::from_secs(1),
            max_attempts: 3,
            record_retry: RetryPolicy::record_default(),
            broker_retry: RetryPolicy::broker_default(),
            startup_max_retries: 10,
            commit_max_retries: 5,
            rebalance_drain_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

pub struct Worker {
    config: WorkerConfig,
    broker: Arc<dyn Broker>,
    dispatcher: Dispatcher,
    offset_tracker: Arc<OffsetTracker>,
    assignment: PartitionAssignment,
    partition_workers: HashMap<Partition, PartitionWorker>,
    /// Revoked partition workers still finishing after the drain deadline
    stopping: HashMap<Partition, PartitionWorker>,
    state: watch::Sender<WorkerState>,
    liveness: Option<HealthHandle>,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        broker: Arc<dyn Broker>,
        checkpoints: Arc<dyn CheckpointStore>,
        processor: Arc<dyn RecordProcessor>,
    ) -> Self {
        let dispatcher = Dispatcher::new(processor, config.max_attempts, config.record_retry);
        let offset_tracker = Arc::new(OffsetTracker::new(
            checkpoints,
            config.broker_retry,
            config.commit_max_retries,
        ));
        let (state, _) = watch::channel(WorkerState::Starting);

        Self {
            assignment: PartitionAssignment::new(config.member_id.clone()),
            config,
            broker,
            dispatcher,
            offset_tracker,
            partition_workers: HashMap::new(),
            stopping: HashMap::new(),
            state,
            liveness: None,
        }
    }

    /// Report liveness through this handle while the worker runs.
    pub fn with_liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Observe state transitions, e.g. for readiness.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn offset_tracker(&self) -> Arc<OffsetTracker> {
        self.offset_tracker.clone()
    }

    pub fn assignment(&self) -> &PartitionAssignment {
        &self.assignment
    }

    /// Run until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// Partition workers are stopped, their progress committed and the group left
    /// on every exit path.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), WorkerError> {
        info!(member_id = %self.config.member_id, "Starting worker");
        self.set_state(WorkerState::Starting);

        let result = match self.connect(&shutdown).await {
            Ok(true) => {
                self.set_state(WorkerState::Assigning);
                self.event_loop(&shutdown).await
            }
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            error!(error = %e, "Worker failed");
        }

        self.stop().await;
        result
    }

    /// Returns false if shutdown was requested before the broker could be reached.
    async fn connect(&self, shutdown: &CancellationToken) -> Result<bool, WorkerError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            let err = match self.broker.connect().await {
                Ok(()) => {
                    info!(attempt = attempt, "Connected to broker");
                    return Ok(true);
                }
                Err(e) => e,
            };

            if attempt > self.config.startup_max_retries {
                return Err(WorkerError::Startup {
                    attempts: attempt,
                    source: err,
                });
            }

            let wait = self.config.broker_retry.retry_interval(attempt);
            warn!(
                attempt = attempt,
                error = %err,
                wait_ms = wait.as_millis() as u64,
                "Failed to connect to broker, retrying"
            );

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    async fn event_loop(&mut self, shutdown: &CancellationToken) -> Result<(), WorkerError> {
        let mut liveness_tick = tokio::time::interval(self.liveness_interval());

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                event = self.broker.next_event() => {
                    let Some(event) = event else {
                        return Err(WorkerError::CoordinatorGone);
                    };
                    metrics::counter!(REBALANCE_EVENTS, "event_type" => event.kind()).increment(1);

                    match event {
                        RebalanceEvent::Assigned(partitions) => self.assign(partitions).await?,
                        RebalanceEvent::Revoked { partitions, ack } => {
                            self.revoke(&partitions).await;
                            if ack.send(()).is_err() {
                                warn!("Coordinator stopped waiting for the revocation to finish");
                            }
                            self.set_state(WorkerState::Running);
                        }
                    }
                }
                _ = liveness_tick.tick() => {
                    if let Some(liveness) = &self.liveness {
                        liveness.report_healthy();
                    }
                }
            }
        }
    }

    async fn assign(&mut self, partitions: Vec<Partition>) -> Result<(), WorkerError> {
        self.set_state(WorkerState::Assigning);

        let mut positions = Vec::with_capacity(partitions.len());
        for partition in partitions {
            if self.partition_workers.contains_key(&partition) {
                continue;
            }

            self.fence(&partition).await;
            let last_committed = self.load_checkpoint(&partition).await?;
            let generation = self.offset_tracker.assign(&partition, last_committed);
            let position = StartPosition::resolve(last_committed, self.config.offset_reset);
            positions.push((partition, generation, position));
        }

        let starts: Vec<(Partition, StartPosition)> = positions
            .iter()
            .map(|(partition, _, position)| (partition.clone(), *position))
            .collect();

        self.broker
            .start_partitions(&starts)
            .await
            .map_err(WorkerError::Positioning)?;

        let worker_config = PartitionWorkerConfig {
            max_batch_size: self.config.max_batch_size,
            fetch_timeout: self.config.fetch_timeout,
            broker_retry: self.config.broker_retry,
        };

        for (partition, generation, position) in positions {
            info!(
                partition = %partition,
                generation = generation,
                position = ?position,
                "Partition assigned"
            );
            self.assignment.assign(partition.clone());
            let worker = PartitionWorker::spawn(
                partition.clone(),
                generation,
                self.broker.clone(),
                self.dispatcher.clone(),
                self.offset_tracker.clone(),
                worker_config.clone(),
            );
            self.partition_workers.insert(partition, worker);
        }

        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.assignment.len() as f64);
        self.set_state(WorkerState::Running);
        Ok(())
    }

    /// Wait for a worker left over from an earlier assignment of `partition`.
    async fn fence(&mut self, partition: &Partition) {
        let Some(mut stale) = self.stopping.remove(partition) else {
            return;
        };

        info!(partition = %partition, "Waiting for the previous partition worker to stop");
        if tokio::time::timeout(self.config.shutdown_timeout, stale.join())
            .await
            .is_err()
        {
            warn!(
                partition = %partition,
                timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                "Previous partition worker did not stop in time, aborting it"
            );
            stale.abort();
            stale.join().await;
        }
    }

    async fn load_checkpoint(&self, partition: &Partition) -> Result<Option<i64>, WorkerError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match self.offset_tracker.last_committed(partition).await {
                Ok(last_committed) => return Ok(last_committed),
                Err(e) if attempt > self.config.startup_max_retries => {
                    return Err(WorkerError::CheckpointLoad {
                        partition: partition.clone(),
                        source: e,
                    });
                }
                Err(e) => {
                    warn!(
                        partition = %partition,
                        attempt = attempt,
                        error = %e,
                        "Failed to load checkpoint, retrying"
                    );
                    tokio::time::sleep(self.config.broker_retry.retry_interval(attempt)).await;
                }
            }
        }
    }

    /// Drain the workers of revoked partitions and release them.
    async fn revoke(&mut self, partitions: &[Partition]) {
        self.set_state(WorkerState::Rebalancing);

        self.stopping.retain(|_, worker| !worker.is_finished());

        let mut draining: Vec<PartitionWorker> = partitions
            .iter()
            .filter_map(|partition| self.partition_workers.remove(partition))
            .collect();
        info!(
            revoked = partitions.len(),
            draining = draining.len(),
            "Draining revoked partitions"
        );

        for worker in &draining {
            worker.start_drain();
        }
        let drained = tokio::time::timeout(
            self.config.rebalance_drain_timeout,
            join_all(draining.iter_mut().map(|worker| worker.join())),
        )
        .await;

        if drained.is_err() {
            warn!(
                timeout_ms = self.config.rebalance_drain_timeout.as_millis() as u64,
                "Drain timed out, uncommitted records will be re-delivered to the next owner"
            );
            for worker in draining {
                if !worker.is_finished() {
                    worker.start_shutdown();
                    self.stopping.insert(worker.partition().clone(), worker);
                }
            }
        }

        self.broker.stop_partitions(partitions).await;
        for partition in partitions {
            self.offset_tracker.release(partition);
            self.assignment.revoke(partition);
        }
        metrics::gauge!(ASSIGNED_PARTITIONS).set(self.assignment.len() as f64);
    }

    async fn stop(&mut self) {
        self.set_state(WorkerState::Stopping);

        let partitions: Vec<Partition> = self.partition_workers.keys().cloned().collect();
        let stopping = self
            .partition_workers
            .drain()
            .chain(self.stopping.drain())
            .map(|(_, worker)| worker.shutdown());

        if tokio::time::timeout(self.config.shutdown_timeout, join_all(stopping))
            .await
            .is_err()
        {
            warn!(
                timeout_ms = self.config.shutdown_timeout.as_millis() as u64,
                "Partition workers did not stop in time"
            );
        }

        self.broker.stop_partitions(&partitions).await;
        for partition in &partitions {
            self.offset_tracker.release(partition);
            self.assignment.revoke(partition);
        }
        metrics::gauge!(ASSIGNED_PARTITIONS).set(0.0);

        if let Err(e) = self.broker.leave().await {
            warn!(error = %e, "Failed to leave the consumer group cleanly");
        }

        self.set_state(WorkerState::Stopped);
        info!(member_id = %self.config.member_id, "Worker stopped");
    }

    fn liveness_interval(&self) -> Duration {
        self.liveness
            .as_ref()
            .map_or(Duration::from_secs(1), |handle| handle.deadline() / 2)
            .max(Duration::from_millis(10))
    }

    fn set_state(&self, state: WorkerState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            info!(from = %previous, to = %state, "Worker state changed");
            metrics::counter!(WORKER_STATE_TRANSITIONS, "state" => state.as_str()).increment(1);
        }
    }
}
