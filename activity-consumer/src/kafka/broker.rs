//! Kafka Broker - one rdkafka consumer shared by every partition worker
//!
//! A single pump task drains the consumer stream and routes each message into a
//! bounded queue for its partition. Partition workers fetch from their own queue.
//! The queue size bounds memory per partition. When one queue is full the pump
//! waits on it, which delays routing for every partition until that worker
//! catches up.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use dashmap::DashMap;
use futures::future::select_all;
use futures::StreamExt;
use rdkafka::consumer::Consumer;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::BorrowedMessage;
use rdkafka::{ClientConfig, Message, Offset, TopicPartitionList};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::{ActivityConsumerContext, ConnectionStatus};
use super::ActivityConsumer;
use crate::coordinator::{GroupCoordinator, RebalanceEvent};
use crate::error::{BrokerError, FetchError};
use crate::fetcher::RecordFetcher;
use crate::metrics_consts::{
    FETCH_BATCH_SIZE, FETCH_BROKER_UNAVAILABLE, FETCH_EMPTY, KAFKA_CONSUMER_ERROR,
    RECORDS_FETCHED, ROUTER_UNOWNED_DROPPED,
};
use crate::types::{Partition, Record, StartPosition};

#[derive(Debug, Clone)]
pub struct KafkaBrokerOptions {
    /// Records buffered per partition before the pump waits
    pub partition_buffer_size: usize,
    /// How long a revocation waits for the worker to drain
    pub rebalance_drain_timeout: Duration,
    /// Seek assigned partitions to the worker's start position. Needed when
    /// checkpoints live outside of Kafka; otherwise the group offsets already match.
    pub position_on_assign: bool,
    /// Timeout of metadata and seek requests
    pub request_timeout: Duration,
}

impl Default for KafkaBrokerOptions {
    fn default() -> Self {
        Self {
            partition_buffer_size: 1000,
            rebalance_drain_timeout: Duration::from_secs(30),
            position_on_assign: false,
            request_timeout: Duration::from_secs(10),
        }
    }
}

type PartitionQueue = Arc<Mutex<mpsc::Receiver<Record>>>;

pub struct KafkaBroker {
    consumer: Arc<ActivityConsumer>,
    topic: String,
    options: KafkaBrokerOptions,
    connection: Arc<ConnectionStatus>,
    closing: Arc<AtomicBool>,
    events: Mutex<mpsc::UnboundedReceiver<RebalanceEvent>>,
    senders: Arc<DashMap<Partition, mpsc::Sender<Record>>>,
    queues: DashMap<Partition, PartitionQueue>,
    subscribed: AtomicBool,
    pump_shutdown: CancellationToken,
    pump: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl KafkaBroker {
    /// Create the consumer. Nothing is sent to the broker before `connect`.
    /// Must be called from within the tokio runtime.
    pub fn new(
        client_config: &ClientConfig,
        topic: impl Into<String>,
        options: KafkaBrokerOptions,
    ) -> Result<Self, BrokerError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(ConnectionStatus::default());
        let closing = Arc::new(AtomicBool::new(false));

        let context = ActivityConsumerContext::new(
            events_tx,
            options.rebalance_drain_timeout,
            connection.clone(),
            closing.clone(),
        );
        let consumer: ActivityConsumer = client_config.create_with_context(context)?;

        Ok(Self {
            consumer: Arc::new(consumer),
            topic: topic.into(),
            options,
            connection,
            closing,
            events: Mutex::new(events_rx),
            senders: Arc::new(DashMap::new()),
            queues: DashMap::new(),
            subscribed: AtomicBool::new(false),
            pump_shutdown: CancellationToken::new(),
            pump: std::sync::Mutex::new(None),
        })
    }

    /// The underlying consumer, for broker-native checkpoints.
    pub fn consumer(&self) -> Arc<ActivityConsumer> {
        self.consumer.clone()
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let topic = self.topic.clone();
        let timeout = self.options.request_timeout;

        let metadata = tokio::task::spawn_blocking(move || {
            consumer.fetch_metadata(Some(topic.as_str()), timeout)
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("metadata task failed: {e}")))?
        .map_err(|e| BrokerError::Unavailable(e.to_string()))?;

        match metadata.topics().iter().find(|t| t.name() == self.topic) {
            Some(topic) if topic.error().is_none() => {
                info!(topic = %self.topic, partitions = topic.partitions().len(), "Topic found");
            }
            _ => warn!(topic = %self.topic, "Topic not found yet, waiting for it to be created"),
        }
        Ok(())
    }

    async fn seek(&self, partition: &Partition, offset: Offset) -> Result<(), BrokerError> {
        let consumer = self.consumer.clone();
        let topic = partition.topic().to_string();
        let partition_number = partition.partition_number();
        let timeout = self.options.request_timeout;

        tokio::task::spawn_blocking(move || {
            consumer.seek(&topic, partition_number, offset, timeout)
        })
        .await
        .map_err(|e| BrokerError::Unavailable(format!("seek task failed: {e}")))??;

        info!(partition = %partition, offset = ?offset, "Positioned partition");
        Ok(())
    }

    fn start_pump(&self) {
        let handle = tokio::spawn(pump(
            self.consumer.clone(),
            self.senders.clone(),
            self.connection.clone(),
            self.pump_shutdown.clone(),
        ));
        if let Ok(mut pump) = self.pump.lock() {
            *pump = Some(handle);
        }
    }

    fn queues_for(&self, partitions: &[Partition]) -> Result<Vec<PartitionQueue>, FetchError> {
        partitions
            .iter()
            .map(|partition| {
                self.queues
                    .get(partition)
                    .map(|queue| queue.value().clone())
                    .ok_or_else(|| FetchError::NotAssigned(partition.clone()))
            })
            .collect()
    }
}

#[async_trait]
impl RecordFetcher for KafkaBroker {
    async fn fetch(
        &self,
        partitions: &[Partition],
        max_batch_size: usize,
        timeout: Duration,
    ) -> Result<Vec<Record>, FetchError> {
        if let Err(reason) = self.connection.check() {
            metrics::counter!(FETCH_BROKER_UNAVAILABLE).increment(1);
            return Err(FetchError::BrokerUnavailable(reason));
        }

        let queues = self.queues_for(partitions)?;
        if queues.is_empty() {
            tokio::time::sleep(timeout).await;
            return Ok(Vec::new());
        }

        let mut receivers = Vec::with_capacity(queues.len());
        for queue in &queues {
            receivers.push(queue.lock().await);
        }

        let mut records = Vec::new();
        let first = {
            let waits = receivers.iter_mut().map(|rx| Box::pin(rx.recv()));
            match tokio::time::timeout(timeout, select_all(waits)).await {
                Ok((Some(record), _, _)) => Some(record),
                Ok((None, index, _)) => return Err(FetchError::NotAssigned(partitions[index].clone())),
                Err(_) => None,
            }
        };

        let Some(first) = first else {
            metrics::counter!(FETCH_EMPTY).increment(1);
            return Ok(records);
        };
        records.push(first);

        for rx in receivers.iter_mut() {
            while records.len() < max_batch_size {
                match rx.try_recv() {
                    Ok(record) => records.push(record),
                    Err(_) => break,
                }
            }
        }

        metrics::counter!(RECORDS_FETCHED).increment(records.len() as u64);
        metrics::histogram!(FETCH_BATCH_SIZE).record(records.len() as f64);
        Ok(records)
    }
}

#[async_trait]
impl GroupCoordinator for KafkaBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        self.ping().await?;
        self.connection.mark_available();

        if !self.subscribed.swap(true, Ordering::SeqCst) {
            if let Err(e) = self.consumer.subscribe(&[self.topic.as_str()]) {
                self.subscribed.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
            info!(topic = %self.topic, "Subscribed, waiting for partition assignment");
            self.start_pump();
        }
        Ok(())
    }

    async fn next_event(&self) -> Option<RebalanceEvent> {
        self.events.lock().await.recv().await
    }

    async fn start_partitions(
        &self,
        positions: &[(Partition, StartPosition)],
    ) -> Result<(), BrokerError> {
        if positions.is_empty() {
            return Ok(());
        }

        let mut started = TopicPartitionList::new();
        for (partition, position) in positions {
            let (tx, rx) = mpsc::channel(self.options.partition_buffer_size.max(1));
            self.queues
                .insert(partition.clone(), Arc::new(Mutex::new(rx)));
            self.senders.insert(partition.clone(), tx);
            started.add_partition_offset(
                partition.topic(),
                partition.partition_number(),
                start_offset(*position),
            )?;
        }

        if self.options.position_on_assign {
            // Only the new partitions move. They are still paused, so nothing was fetched yet.
            for (partition, position) in positions {
                self.seek(partition, start_offset(*position)).await?;
            }
        }

        self.consumer.resume(&started)?;
        info!(count = positions.len(), "Resumed assigned partitions");
        Ok(())
    }

    async fn stop_partitions(&self, partitions: &[Partition]) {
        for partition in partitions {
            // Dropping the queue also releases a pump blocked on it
            self.senders.remove(partition);
            self.queues.remove(partition);
        }
    }

    async fn leave(&self) -> Result<(), BrokerError> {
        self.closing.store(true, Ordering::SeqCst);
        self.pump_shutdown.cancel();

        let pump = self.pump.lock().ok().and_then(|mut pump| pump.take());
        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                warn!(error = %e, "Consumer pump panicked");
            }
        }

        self.senders.clear();
        self.queues.clear();

        if self.subscribed.swap(false, Ordering::SeqCst) {
            self.consumer.unsubscribe();
            info!(topic = %self.topic, "Left the consumer group");
        }
        Ok(())
    }
}

fn start_offset(position: StartPosition) -> Offset {
    match position {
        StartPosition::Offset(offset) => Offset::Offset(offset),
        StartPosition::Earliest => Offset::Beginning,
        StartPosition::Latest => Offset::End,
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis);

    Record::new(
        Partition::new(message.topic(), message.partition()),
        message.offset(),
        message.key().map(Bytes::copy_from_slice),
        message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        timestamp,
    )
}

async fn pump(
    consumer: Arc<ActivityConsumer>,
    senders: Arc<DashMap<Partition, mpsc::Sender<Record>>>,
    connection: Arc<ConnectionStatus>,
    shutdown: CancellationToken,
) {
    info!("Starting consumer pump");
    let mut stream = consumer.stream();
    let mut consecutive_errors: u64 = 0;

    loop {
        let message = tokio::select! {
            _ = shutdown.cancelled() => break,
            message = stream.next() => message,
        };

        let record = match message {
            None => {
                warn!("Consumer stream ended");
                break;
            }
            Some(Ok(message)) => {
                consecutive_errors = 0;
                connection.mark_available();
                to_record(&message)
            }
            Some(Err(e)) => {
                consecutive_errors += 1;
                handle_kafka_error(&e, &connection);
                tokio::time::sleep(Duration::from_millis(100 * consecutive_errors.min(10))).await;
                continue;
            }
        };

        // Clone out of the map so the guard is not held while waiting on the queue
        let sender = senders
            .get(record.partition())
            .map(|sender| sender.value().clone());
        let Some(sender) = sender else {
            debug!(partition = %record.partition(), offset = record.offset(), "Dropping record for unowned partition");
            metrics::counter!(ROUTER_UNOWNED_DROPPED).increment(1);
            continue;
        };

        tokio::select! {
            _ = shutdown.cancelled() => break,
            sent = sender.send(record) => {
                if let Err(unsent) = sent {
                    debug!(partition = %unsent.0.partition(), "Partition released while routing");
                    metrics::counter!(ROUTER_UNOWNED_DROPPED).increment(1);
                }
            }
        }
    }

    info!("Consumer pump stopped");
}

fn handle_kafka_error(e: &KafkaError, connection: &ConnectionStatus) {
    match e {
        KafkaError::Global(
            code @ (RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure),
        ) => {
            warn!(code = ?code, "Broker connection lost while consuming");
            metrics::counter!(KAFKA_CONSUMER_ERROR, &[("level", "warn"), ("error", "connection")])
                .increment(1);
            connection.mark_unavailable(format!("{code:?}"));
        }
        KafkaError::MessageConsumption(code) => {
            warn!(code = ?code, "Kafka consumer error");
            metrics::counter!(KAFKA_CONSUMER_ERROR, &[("level", "warn"), ("error", "consumer")])
                .increment(1);
        }
        _ => {
            error!(error = %e, "Unexpected Kafka error");
            metrics::counter!(KAFKA_CONSUMER_ERROR, &[("level", "error"), ("error", "unexpected")])
                .increment(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_offsets() {
        assert_eq!(start_offset(StartPosition::Offset(8)), Offset::Offset(8));
        assert_eq!(start_offset(StartPosition::Earliest), Offset::Beginning);
        assert_eq!(start_offset(StartPosition::Latest), Offset::End);
    }

    #[test]
    fn test_connection_errors_mark_broker_unavailable() {
        let connection = ConnectionStatus::default();

        handle_kafka_error(
            &KafkaError::MessageConsumption(RDKafkaErrorCode::OperationTimedOut),
            &connection,
        );
        assert!(connection.check().is_ok());

        handle_kafka_error(
            &KafkaError::Global(RDKafkaErrorCode::AllBrokersDown),
            &connection,
        );
        assert!(connection.check().is_err());
    }
}
