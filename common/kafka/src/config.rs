use std::fmt;
use std::str::FromStr;

use envconfig::Envconfig;

#[derive(Envconfig, Clone, Debug)]
pub struct KafkaConfig {
    // Comma-separated list of bootstrap brokers
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    // When set, also used as group.instance.id for static membership
    pub kafka_client_id: Option<String>,

    #[envconfig(default = "30000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "5000")]
    pub kafka_heartbeat_interval_ms: u32,

    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,
}

impl KafkaConfig {
    /// The bootstrap addresses as a list, ignoring blanks around commas.
    pub fn bootstrap_servers(&self) -> Vec<String> {
        self.kafka_hosts
            .split(',')
            .map(str::trim)
            .filter(|host| !host.is_empty())
            .map(str::to_owned)
            .collect()
    }
}

#[derive(Envconfig, Clone, Debug)]
pub struct ConsumerConfig {
    #[envconfig(default = "recommendation-service")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "user-activity")]
    pub kafka_consumer_topic: String,

    // Where to start when a partition has no committed offset yet
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: OffsetReset,
}

/// Starting point for a partition that has never been committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OffsetReset {
    #[default]
    Earliest,
    Latest,
}

impl OffsetReset {
    /// The value librdkafka expects for `auto.offset.reset`.
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

impl fmt::Display for OffsetReset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid offset reset policy {0:?}, expected earliest or latest")]
pub struct ParseOffsetResetError(String);

impl FromStr for OffsetReset {
    type Err = ParseOffsetResetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "earliest" => Ok(OffsetReset::Earliest),
            "latest" => Ok(OffsetReset::Latest),
            _ => Err(ParseOffsetResetError(s.to_owned())),
        }
    }
}
