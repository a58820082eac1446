use std::collections::BTreeSet;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

pub use common_kafka::OffsetReset;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// A single record as handed out by the broker. Owned and immutable, so it can
/// outlive the consumer buffer it was read from.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    partition: Partition,
    offset: i64,
    key: Option<Bytes>,
    value: Bytes,
    timestamp: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(
        partition: Partition,
        offset: i64,
        key: Option<Bytes>,
        value: Bytes,
        timestamp: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            partition,
            offset,
            key,
            value,
            timestamp,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.timestamp
    }
}

/// The slice of the group assignment owned by one worker instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAssignment {
    member_id: String,
    partitions: BTreeSet<Partition>,
}

impl PartitionAssignment {
    pub fn new(member_id: impl Into<String>) -> Self {
        Self {
            member_id: member_id.into(),
            partitions: BTreeSet::new(),
        }
    }

    pub fn member_id(&self) -> &str {
        &self.member_id
    }

    /// Returns true if the partition was not already owned.
    pub fn assign(&mut self, partition: Partition) -> bool {
        self.partitions.insert(partition)
    }

    /// Returns true if the partition was owned.
    pub fn revoke(&mut self, partition: &Partition) -> bool {
        self.partitions.remove(partition)
    }

    /// The member responsible for a partition, as far as this worker knows.
    pub fn owner_of(&self, partition: &Partition) -> Option<&str> {
        self.partitions
            .contains(partition)
            .then_some(self.member_id.as_str())
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.iter()
    }

    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }
}

/// Result of handing one record to the processing callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Retry,
    Skip,
}

impl Outcome {
    /// Success and Skip both let the offset be committed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::Retry)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Success => "success",
            Outcome::Retry => "retry",
            Outcome::Skip => "skip",
        }
    }
}

/// Where fetching resumes for a freshly assigned partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPosition {
    Offset(i64),
    Earliest,
    Latest,
}

impl StartPosition {
    /// Resume right after the last committed offset, or fall back to the reset policy.
    pub fn resolve(last_committed: Option<i64>, reset: OffsetReset) -> Self {
        match (last_committed, reset) {
            (Some(offset), _) => StartPosition::Offset(offset + 1),
            (None, OffsetReset::Earliest) => StartPosition::Earliest,
            (None, OffsetReset::Latest) => StartPosition::Latest,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Assigning,
    Running,
    Rebalancing,
    Stopping,
    Stopped,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Assigning => "assigning",
            WorkerState::Running => "running",
            WorkerState::Rebalancing => "rebalancing",
            WorkerState::Stopping => "stopping",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_position_resumes_after_commit() {
        assert_eq!(
            StartPosition::resolve(Some(7), OffsetReset::Latest),
            StartPosition::Offset(8)
        );
        assert_eq!(
            StartPosition::resolve(None, OffsetReset::Earliest),
            StartPosition::Earliest
        );
        assert_eq!(
            StartPosition::resolve(None, OffsetReset::Latest),
            StartPosition::Latest
        );
    }

    #[test]
    fn test_assignment_ownership() {
        let mut assignment = PartitionAssignment::new("worker-a");
        let p0 = Partition::new("user-activity", 0);
        let p1 = Partition::new("user-activity", 1);

        assert!(assignment.assign(p0.clone()));
        assert!(!assignment.assign(p0.clone()));
        assert_eq!(assignment.owner_of(&p0), Some("worker-a"));
        assert_eq!(assignment.owner_of(&p1), None);

        assert!(assignment.revoke(&p0));
        assert!(assignment.is_empty());
    }

    #[test]
    fn test_outcome_terminality() {
        assert!(Outcome::Success.is_terminal());
        assert!(Outcome::Skip.is_terminal());
        assert!(!Outcome::Retry.is_terminal());
    }

    #[test]
    fn test_partition_display() {
        assert_eq!(Partition::new("user-activity", 3).to_string(), "user-activity:3");
    }
}
