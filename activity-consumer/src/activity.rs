use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info};

use crate::dispatcher::RecordProcessor;
use crate::error::ProcessingError;
use crate::types::Record;

/// A user activity event as published on the activity topic.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ActivityEvent {
    pub user_id: String,
    pub action: String,
    #[serde(default)]
    pub item_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Anything else the producer attached
    #[serde(flatten)]
    pub properties: Map<String, Value>,
}

impl ActivityEvent {
    pub fn decode(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// Decodes activity events and logs them. Stands in for the recommendation
/// model update, which is supplied by the embedding application.
#[derive(Debug, Default, Clone, Copy)]
pub struct ActivityLogger;

#[async_trait]
impl RecordProcessor for ActivityLogger {
    async fn process(&self, record: &Record) -> Result<(), ProcessingError> {
        if record.value().is_empty() {
            debug!(
                partition = record.partition_number(),
                offset = record.offset(),
                "Skipping tombstone"
            );
            return Ok(());
        }

        // Retrying cannot fix a payload that does not decode
        let event = ActivityEvent::decode(record.value()).map_err(ProcessingError::permanent)?;

        info!(
            partition = record.partition_number(),
            offset = record.offset(),
            user_id = %event.user_id,
            action = %event.action,
            item_id = ?event.item_id,
            "Processing user activity"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::test_utils::{test_partition, test_record};

    fn record_with(value: &'static [u8]) -> Record {
        Record::new(test_partition(0), 1, None, Bytes::from_static(value), None)
    }

    #[test]
    fn test_decode_keeps_extra_properties() {
        let event = ActivityEvent::decode(
            br#"{"user_id":"u1","action":"click","item_id":"sku-9","timestamp":"2024-05-01T10:00:00Z","source":"mobile"}"#,
        )
        .unwrap();

        assert_eq!(event.user_id, "u1");
        assert_eq!(event.action, "click");
        assert_eq!(event.item_id.as_deref(), Some("sku-9"));
        assert!(event.timestamp.is_some());
        assert_eq!(event.properties.get("source"), Some(&Value::from("mobile")));
    }

    #[tokio::test]
    async fn test_valid_event_succeeds() {
        assert!(ActivityLogger.process(&test_record(0, 5)).await.is_ok());
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_permanent() {
        let result = ActivityLogger.process(&record_with(b"not json")).await;

        assert!(matches!(result, Err(ProcessingError::Permanent(_))));
    }

    #[tokio::test]
    async fn test_tombstone_is_accepted() {
        assert!(ActivityLogger.process(&record_with(b"")).await.is_ok());
    }
}
