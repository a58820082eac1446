use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::consumer::{BaseConsumer, Consumer, ConsumerContext, Rebalance};
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use rdkafka::{ClientContext, Statistics, TopicPartitionList};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::coordinator::RebalanceEvent;
use crate::metrics_consts::KAFKA_CONSUMER_ERROR;
use crate::types::Partition;

/// Whether the broker can currently be reached, as last reported by librdkafka.
#[derive(Debug, Default)]
pub struct ConnectionStatus {
    unavailable: AtomicBool,
    reason: Mutex<String>,
}

impl ConnectionStatus {
    pub fn mark_unavailable(&self, reason: impl Into<String>) {
        if let Ok(mut current) = self.reason.lock() {
            *current = reason.into();
        }
        self.unavailable.store(true, Ordering::SeqCst);
    }

    pub fn mark_available(&self) {
        if self.unavailable.swap(false, Ordering::SeqCst) {
            info!("Broker connection restored");
        }
    }

    /// `Err` carries the reason the broker was last seen unreachable.
    pub fn check(&self) -> Result<(), String> {
        if !self.unavailable.load(Ordering::SeqCst) {
            return Ok(());
        }
        Err(self
            .reason
            .lock()
            .map(|reason| reason.clone())
            .unwrap_or_else(|_| "broker unavailable".to_string()))
    }
}

pub(crate) fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements()
        .iter()
        .map(|elem| Partition::new(elem.topic(), elem.partition()))
        .collect()
}

/// Bridges librdkafka's rebalance callbacks to the worker.
///
/// Callbacks run on the thread polling the consumer. Assignments pause the new
/// partitions and are handed over without waiting. Revocations block the callback
/// until the worker drained and committed the revoked partitions, or until
/// `drain_timeout` elapses.
pub struct ActivityConsumerContext {
    rt_handle: Handle,
    events: mpsc::UnboundedSender<RebalanceEvent>,
    drain_timeout: Duration,
    connection: Arc<ConnectionStatus>,
    /// Set once the worker left the group. Revocations then release immediately.
    closing: Arc<AtomicBool>,
}

impl ActivityConsumerContext {
    /// Must be called from within the tokio runtime.
    pub fn new(
        events: mpsc::UnboundedSender<RebalanceEvent>,
        drain_timeout: Duration,
        connection: Arc<ConnectionStatus>,
        closing: Arc<AtomicBool>,
    ) -> Self {
        Self {
            rt_handle: Handle::current(),
            events,
            drain_timeout,
            connection,
            closing,
        }
    }

    fn wait_for_drain(&self, acked: oneshot::Receiver<()>) {
        let drained = tokio::task::block_in_place(|| {
            self.rt_handle
                .block_on(tokio::time::timeout(self.drain_timeout, acked))
        });

        match drained {
            Ok(Ok(())) => info!("Revoked partitions drained"),
            Ok(Err(_)) => warn!("Worker went away before acknowledging the revocation"),
            Err(_) => warn!(
                timeout_ms = self.drain_timeout.as_millis() as u64,
                "Timed out waiting for revoked partitions to drain"
            ),
        }
    }
}

impl ClientContext for ActivityConsumerContext {
    fn stats(&self, statistics: Statistics) {
        // Statistics only arrive while librdkafka is polled, so use them to notice recoveries
        if statistics.brokers.values().any(|broker| broker.state == "UP") {
            self.connection.mark_available();
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        match &error {
            KafkaError::Global(
                code @ (RDKafkaErrorCode::AllBrokersDown | RDKafkaErrorCode::BrokerTransportFailure),
            ) => {
                warn!(code = ?code, reason = reason, "Broker connection lost");
                metrics::counter!(KAFKA_CONSUMER_ERROR, &[("level", "warn"), ("error", "connection")])
                    .increment(1);
                self.connection.mark_unavailable(format!("{code:?}: {reason}"));
            }
            _ => {
                error!(error = %error, reason = reason, "librdkafka error");
                metrics::counter!(KAFKA_CONSUMER_ERROR, &[("level", "error"), ("error", "client")])
                    .increment(1);
            }
        }
    }
}

impl ConsumerContext for ActivityConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        let Rebalance::Revoke(tpl) = rebalance else {
            return;
        };
        if tpl.count() == 0 {
            debug!("Skipping empty revoke");
            return;
        }
        if self.closing.load(Ordering::SeqCst) {
            debug!("Consumer closing, releasing partitions without draining");
            return;
        }

        let partitions = partitions_of(tpl);
        info!(count = partitions.len(), "Revoking partitions");

        let (ack, acked) = oneshot::channel();
        if self
            .events
            .send(RebalanceEvent::Revoked { partitions, ack })
            .is_err()
        {
            warn!("Worker is gone, releasing revoked partitions without draining");
            return;
        }

        self.wait_for_drain(acked);
    }

    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                if tpl.count() == 0 {
                    debug!("Skipping empty assign");
                    return;
                }

                // Nothing may be delivered before the worker positioned the partition
                if let Err(e) = base_consumer.pause(tpl) {
                    error!(error = %e, "Failed to pause newly assigned partitions");
                }

                let partitions = partitions_of(tpl);
                info!(count = partitions.len(), "Assigned partitions, paused until positioned");

                if self.events.send(RebalanceEvent::Assigned(partitions)).is_err() {
                    warn!("Worker is gone, assigned partitions stay paused");
                }
            }
            Rebalance::Revoke(_) => debug!("Revocation complete"),
            Rebalance::Error(e) => error!(error = %e, "Rebalance error"),
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(error = %e, partitions = offsets.count(), "Offset commit failed");
        }
    }
}
