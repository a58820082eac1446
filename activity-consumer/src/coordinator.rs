//! Consumer group membership as seen by one worker.
//!
//! The broker owns the group protocol. A coordinator only surfaces its decisions
//! as [`RebalanceEvent`]s and positions the partitions the worker was given.

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::BrokerError;
use crate::fetcher::RecordFetcher;
use crate::types::{Partition, StartPosition};

#[derive(Debug)]
pub enum RebalanceEvent {
    /// Partitions newly owned by this worker. Nothing is fetched for them until
    /// [`GroupCoordinator::start_partitions`] is called.
    Assigned(Vec<Partition>),
    /// Partitions taken away, or lost. The coordinator holds on to them until
    /// `ack` fires, so the worker can drain and commit first.
    Revoked {
        partitions: Vec<Partition>,
        ack: oneshot::Sender<()>,
    },
}

impl RebalanceEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            RebalanceEvent::Assigned(_) => "assign",
            RebalanceEvent::Revoked { .. } => "revoke",
        }
    }
}

#[async_trait]
pub trait GroupCoordinator: Send + Sync {
    /// Reach the broker and join the group. Safe to call again after a failure.
    async fn connect(&self) -> Result<(), BrokerError>;

    /// Wait for the next membership change. `None` once the coordinator is closed.
    async fn next_event(&self) -> Option<RebalanceEvent>;

    /// Position freshly assigned partitions and let records flow for them.
    async fn start_partitions(
        &self,
        positions: &[(Partition, StartPosition)],
    ) -> Result<(), BrokerError>;

    /// Stop delivering records for partitions the worker is giving up.
    async fn stop_partitions(&self, partitions: &[Partition]);

    /// Leave the group and release the connection.
    async fn leave(&self) -> Result<(), BrokerError>;
}

/// A broker connection: group membership plus record fetching, shared by the
/// worker and its partition tasks.
pub trait Broker: GroupCoordinator + RecordFetcher {}

impl<T: GroupCoordinator + RecordFetcher> Broker for T {}
