pub mod client;
pub mod config;

pub use client::ConsumerConfigBuilder;
pub use config::{ConsumerConfig, KafkaConfig, OffsetReset};
