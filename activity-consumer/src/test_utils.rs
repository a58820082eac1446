//! In-memory stand-ins for the broker, the checkpoint store and the processing
//! callback, shared by unit and integration tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{mpsc, oneshot};

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::coordinator::{GroupCoordinator, RebalanceEvent};
use crate::dispatcher::RecordProcessor;
use crate::error::{BrokerError, CheckpointError, FetchError, ProcessingError};
use crate::fetcher::RecordFetcher;
use crate::types::{Partition, Record, StartPosition};

pub const TEST_TOPIC: &str = "user-activity";

pub fn test_partition(partition_number: i32) -> Partition {
    Partition::new(TEST_TOPIC, partition_number)
}

pub fn test_record(partition_number: i32, offset: i64) -> Record {
    Record::new(
        test_partition(partition_number),
        offset,
        None,
        Bytes::from(format!(r#"{{"user_id":"user-{offset}","action":"view"}}"#)),
        Some(Utc::now()),
    )
}

/// Poll `check` until it holds or `timeout` elapses. Returns the last result.
pub async fn eventually<F>(check: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !check() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    check()
}

/// A broker keeping one in-memory log per partition.
///
/// Connecting for the first time assigns every partition to the caller, like a
/// group with a single member. Revocations are triggered by the test.
pub struct MemoryBroker {
    partitions: Vec<Partition>,
    logs: Mutex<HashMap<Partition, Vec<Record>>>,
    /// Next offset to hand out, for started partitions only
    positions: Mutex<HashMap<Partition, i64>>,
    fetched: Mutex<Vec<(Partition, i64)>>,
    events_tx: mpsc::UnboundedSender<RebalanceEvent>,
    events_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<RebalanceEvent>>,
    connect_failures: AtomicU32,
    connect_attempts: AtomicU32,
    fetch_failures: AtomicU32,
    joined: AtomicBool,
    left: AtomicBool,
}

impl MemoryBroker {
    pub fn new(partition_count: i32) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let partitions: Vec<Partition> = (0..partition_count).map(test_partition).collect();

        Self {
            logs: Mutex::new(partitions.iter().map(|p| (p.clone(), Vec::new())).collect()),
            partitions,
            positions: Mutex::new(HashMap::new()),
            fetched: Mutex::new(Vec::new()),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            connect_failures: AtomicU32::new(0),
            connect_attempts: AtomicU32::new(0),
            fetch_failures: AtomicU32::new(0),
            joined: AtomicBool::new(false),
            left: AtomicBool::new(false),
        }
    }

    /// Append records with the given offsets. Offsets must keep increasing.
    pub fn produce(&self, partition_number: i32, offsets: impl IntoIterator<Item = i64>) {
        let mut logs = self.logs.lock().unwrap();
        let log = logs.entry(test_partition(partition_number)).or_default();
        for offset in offsets {
            assert!(log.last().map_or(true, |last| offset > last.offset()));
            log.push(test_record(partition_number, offset));
        }
    }

    /// Move the fetch position back, so already fetched records come again.
    pub fn rewind(&self, partition_number: i32, offset: i64) {
        self.positions
            .lock()
            .unwrap()
            .insert(test_partition(partition_number), offset);
    }

    pub fn fail_connects(&self, count: u32) {
        self.connect_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_fetches(&self, count: u32) {
        self.fetch_failures.store(count, Ordering::SeqCst);
    }

    pub fn connect_attempts(&self) -> u32 {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn has_left(&self) -> bool {
        self.left.load(Ordering::SeqCst)
    }

    pub fn is_started(&self, partition_number: i32) -> bool {
        self.positions
            .lock()
            .unwrap()
            .contains_key(&test_partition(partition_number))
    }

    /// Every offset handed out for a partition, in fetch order.
    pub fn fetched_offsets(&self, partition_number: i32) -> Vec<i64> {
        let partition = test_partition(partition_number);
        self.fetched
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == partition)
            .map(|(_, offset)| *offset)
            .collect()
    }

    pub fn assign(&self, partition_numbers: &[i32]) {
        let partitions = partition_numbers.iter().copied().map(test_partition).collect();
        self.send_event(RebalanceEvent::Assigned(partitions));
    }

    /// Revoke partitions. The receiver fires once the worker acknowledged.
    pub fn revoke(&self, partition_numbers: &[i32]) -> oneshot::Receiver<()> {
        let (ack, acked) = oneshot::channel();
        let partitions = partition_numbers.iter().copied().map(test_partition).collect();
        self.send_event(RebalanceEvent::Revoked { partitions, ack });
        acked
    }

    fn send_event(&self, event: RebalanceEvent) {
        // The receiving half lives in `self`, so the channel is never closed
        if self.events_tx.send(event).is_err() {
            panic!("rebalance event channel closed");
        }
    }

    fn take_batch(&self, partitions: &[Partition], max_batch_size: usize) -> Result<Vec<Record>, FetchError> {
        let logs = self.logs.lock().unwrap();
        let mut positions = self.positions.lock().unwrap();
        let mut batch = Vec::new();

        for partition in partitions {
            let position = positions
                .get_mut(partition)
                .ok_or_else(|| FetchError::NotAssigned(partition.clone()))?;
            let start = *position;

            let available = logs
                .get(partition)
                .into_iter()
                .flatten()
                .filter(|record| record.offset() >= start)
                .take(max_batch_size.saturating_sub(batch.len()));

            for record in available {
                *position = record.offset() + 1;
                batch.push(record.clone());
            }
        }

        let mut fetched = self.fetched.lock().unwrap();
        fetched.extend(batch.iter().map(|r| (r.partition().clone(), r.offset())));
        Ok(batch)
    }
}

#[async_trait]
impl RecordFetcher for MemoryBroker {
    async fn fetch(
        &self,
        partitions: &[Partition],
        max_batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, FetchError> {
        let remaining_failures = self.fetch_failures.load(Ordering::SeqCst);
        if remaining_failures > 0 {
            self.fetch_failures.store(remaining_failures - 1, Ordering::SeqCst);
            return Err(FetchError::BrokerUnavailable("injected fetch failure".to_string()));
        }

        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.take_batch(partitions, max_batch_size)?;
            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            tokio::time::sleep((deadline - now).min(Duration::from_millis(5))).await;
        }
    }
}

#[async_trait]
impl GroupCoordinator for MemoryBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        let remaining_failures = self.connect_failures.load(Ordering::SeqCst);
        if remaining_failures > 0 {
            self.connect_failures
                .store(remaining_failures - 1, Ordering::SeqCst);
            return Err(BrokerError::Unavailable("injected connect failure".to_string()));
        }

        if !self.joined.swap(true, Ordering::SeqCst) {
            self.send_event(RebalanceEvent::Assigned(self.partitions.clone()));
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<RebalanceEvent> {
        self.events_rx.lock().await.recv().await
    }

    async fn start_partitions(
        &self,
        positions: &[(Partition, StartPosition)],
    ) -> Result<(), BrokerError> {
        let logs = self.logs.lock().unwrap();
        let mut started = self.positions.lock().unwrap();

        for (partition, position) in positions {
            let log = logs.get(partition).map(Vec::as_slice).unwrap_or_default();
            let offset = match position {
                StartPosition::Offset(offset) => *offset,
                StartPosition::Earliest => log.first().map_or(0, |r| r.offset()),
                StartPosition::Latest => log.last().map_or(0, |r| r.offset() + 1),
            };
            started.insert(partition.clone(), offset);
        }
        Ok(())
    }

    async fn stop_partitions(&self, partitions: &[Partition]) {
        let mut started = self.positions.lock().unwrap();
        for partition in partitions {
            started.remove(partition);
        }
    }

    async fn leave(&self) -> Result<(), BrokerError> {
        self.left.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Transient,
    Permanent,
}

/// A processing callback failing on chosen records in a scripted way. Records
/// without a script succeed on the first invocation.
#[derive(Default)]
pub struct ScriptedProcessor {
    scripts: Mutex<HashMap<(i32, i64), VecDeque<Step>>>,
    always_failing: Mutex<HashSet<(i32, i64)>>,
    invocations: Mutex<HashMap<(i32, i64), u32>>,
    processed: Mutex<Vec<(i32, i64)>>,
    /// Current and highest number of concurrent invocations, per partition
    in_flight: Mutex<HashMap<i32, (u32, u32)>>,
    delay: Option<Duration>,
}

impl ScriptedProcessor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long inside every invocation.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    /// Fail the next invocations of a record with these steps, then succeed.
    pub fn script(&self, partition_number: i32, offset: i64, steps: Vec<Step>) {
        self.scripts
            .lock()
            .unwrap()
            .insert((partition_number, offset), steps.into());
    }

    /// Fail every invocation of a record with a transient error.
    pub fn always_fail(&self, partition_number: i32, offset: i64) {
        self.always_failing
            .lock()
            .unwrap()
            .insert((partition_number, offset));
    }

    pub fn invocations(&self, partition_number: i32, offset: i64) -> u32 {
        self.invocations
            .lock()
            .unwrap()
            .get(&(partition_number, offset))
            .copied()
            .unwrap_or(0)
    }

    /// The most invocations that ever ran at the same time on a partition.
    pub fn max_in_flight(&self, partition_number: i32) -> u32 {
        self.in_flight
            .lock()
            .unwrap()
            .get(&partition_number)
            .map_or(0, |(_, max)| *max)
    }

    fn enter(&self, partition_number: i32) {
        let mut in_flight = self.in_flight.lock().unwrap();
        let (current, max) = in_flight.entry(partition_number).or_default();
        *current += 1;
        *max = (*max).max(*current);
    }

    fn leave(&self, partition_number: i32) {
        if let Some((current, _)) = self.in_flight.lock().unwrap().get_mut(&partition_number) {
            *current = current.saturating_sub(1);
        }
    }

    async fn run_script(&self, key: (i32, i64)) -> Result<(), ProcessingError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        if self.always_failing.lock().unwrap().contains(&key) {
            return Err(ProcessingError::transient(anyhow!("downstream unavailable")));
        }

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front);

        match step {
            Some(Step::Transient) => Err(ProcessingError::transient(anyhow!("downstream timeout"))),
            Some(Step::Permanent) => Err(ProcessingError::permanent(anyhow!("undecodable payload"))),
            None => {
                self.processed.lock().unwrap().push(key);
                Ok(())
            }
        }
    }

    /// Offsets processed successfully on a partition, in processing order.
    pub fn processed(&self, partition_number: i32) -> Vec<i64> {
        self.processed
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| *p == partition_number)
            .map(|(_, offset)| *offset)
            .collect()
    }
}

#[async_trait]
impl RecordProcessor for ScriptedProcessor {
    async fn process(&self, record: &Record) -> Result<(), ProcessingError> {
        let key = (record.partition_number(), record.offset());
        *self.invocations.lock().unwrap().entry(key).or_default() += 1;

        self.enter(key.0);
        let result = self.run_script(key).await;
        self.leave(key.0);
        result
    }
}

/// A memory checkpoint store whose loads and stores can be made to fail.
#[derive(Default)]
pub struct FlakyCheckpointStore {
    inner: MemoryCheckpointStore,
    store_failures: AtomicU32,
    load_failures: AtomicU32,
    store_attempts: AtomicU32,
}

impl FlakyCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryCheckpointStore {
        &self.inner
    }

    pub fn fail_next(&self, count: u32) {
        self.store_failures.store(count, Ordering::SeqCst);
    }

    pub fn fail_loads(&self, count: u32) {
        self.load_failures.store(count, Ordering::SeqCst);
    }

    pub fn store_attempts(&self) -> u32 {
        self.store_attempts.load(Ordering::SeqCst)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn load(&self, partition: &Partition) -> Result<Option<i64>, CheckpointError> {
        if Self::take_failure(&self.load_failures) {
            return Err(CheckpointError::Unavailable("injected load failure".to_string()));
        }
        self.inner.load(partition).await
    }

    async fn store(&self, partition: &Partition, offset: i64) -> Result<(), CheckpointError> {
        self.store_attempts.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.store_failures) {
            return Err(CheckpointError::Unavailable("injected store failure".to_string()));
        }
        self.inner.store(partition, offset).await
    }
}
