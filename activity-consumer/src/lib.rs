//! Durable consumption of user activity events from a Kafka-compatible broker.
//!
//! A [`Worker`](worker::Worker) joins a consumer group, runs one task per assigned
//! partition and hands every record to a [`RecordProcessor`](dispatcher::RecordProcessor).
//! Offsets are committed only once every record up to them was handled, so
//! delivery is at-least-once.

pub mod activity;
pub mod checkpoint;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod fetcher;
pub mod health;
pub mod kafka;
pub mod metrics_consts;
pub mod offset_tracker;
pub mod partition_worker;
pub mod retry;
pub mod server;
pub mod test_utils;
pub mod types;
pub mod worker;
