use rdkafka::ClientConfig;
use tracing::debug;

use crate::config::{ConsumerConfig, KafkaConfig, OffsetReset};

/// Builds the librdkafka configuration for a group consumer that manages its own
/// offsets: auto commit and auto offset store are both disabled, progress is only
/// ever committed explicitly once records have been handled.
pub struct ConsumerConfigBuilder {
    config: ClientConfig,
}

impl ConsumerConfigBuilder {
    pub fn for_consumer_group(bootstrap_servers: &str, group_id: &str) -> Self {
        let mut config = ClientConfig::new();

        config
            .set("bootstrap.servers", bootstrap_servers)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false")
            .set("socket.timeout.ms", "10000")
            .set("statistics.interval.ms", "10000");

        Self { config }
    }

    /// Apply the environment-derived settings shared by every consumer.
    pub fn from_env_config(kafka: &KafkaConfig, consumer: &ConsumerConfig) -> Self {
        let builder = Self::for_consumer_group(
            &kafka.bootstrap_servers().join(","),
            &consumer.kafka_consumer_group,
        )
        .with_tls(kafka.kafka_tls)
        .with_offset_reset(consumer.kafka_consumer_offset_reset)
        .with_session_timeout_ms(kafka.kafka_session_timeout_ms)
        .with_heartbeat_interval_ms(kafka.kafka_heartbeat_interval_ms)
        .with_max_poll_interval_ms(kafka.kafka_max_poll_interval_ms);

        match &kafka.kafka_client_id {
            Some(client_id) => builder.with_static_membership(client_id),
            None => builder,
        }
    }

    pub fn with_tls(mut self, enabled: bool) -> Self {
        if enabled {
            self.config
                .set("security.protocol", "ssl")
                .set("enable.ssl.certificate.verification", "false");
        }
        self
    }

    pub fn with_offset_reset(mut self, policy: OffsetReset) -> Self {
        self.config.set("auto.offset.reset", policy.as_str());
        self
    }

    /// How long the group coordinator waits for heartbeats before evicting us.
    pub fn with_session_timeout_ms(mut self, ms: u32) -> Self {
        self.config.set("session.timeout.ms", ms.to_string());
        self
    }

    /// Should stay around a third of the session timeout.
    pub fn with_heartbeat_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("heartbeat.interval.ms", ms.to_string());
        self
    }

    pub fn with_max_poll_interval_ms(mut self, ms: u32) -> Self {
        self.config.set("max.poll.interval.ms", ms.to_string());
        self
    }

    /// Static membership keeps our partitions through quick restarts.
    pub fn with_static_membership(mut self, client_id: &str) -> Self {
        self.config
            .set("client.id", client_id)
            .set("group.instance.id", client_id);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key)
    }

    pub fn build(self) -> ClientConfig {
        debug!("rdkafka consumer configuration: {:?}", self.config);
        self.config
    }
}
