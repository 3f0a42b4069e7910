//! Event envelopes and the JSON payload they serialize to.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Event name used by [`crate::webhooks::WebhookService::test_delivery`].
pub const TEST_EVENT: &str = "webhook.test";

/// Optional context attached to an emitted event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// A business event as delivered to subscribers.
///
/// Serializes to
/// `{"event", "data", "entityId"?, "entityType"?, "metadata"?, "timestamp"}`
/// with absent optional fields omitted and the timestamp in RFC 3339.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event: String,
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
    pub timestamp: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event: impl Into<String>, data: Value, options: EmitOptions, timestamp: DateTime<Utc>) -> Self {
        Self {
            event: event.into(),
            data,
            entity_id: options.entity_id,
            entity_type: options.entity_type,
            metadata: options.metadata,
            timestamp,
        }
    }

    /// The synthetic event sent by a subscription test.
    pub fn test_event(timestamp: DateTime<Utc>) -> Self {
        let data = serde_json::json!({
            "message": "This is a test webhook delivery",
            "timestamp": timestamp,
        });
        Self::new(TEST_EVENT, data, EmitOptions::default(), timestamp)
    }

    /// Serialize to the exact bytes stored on each delivery.
    pub fn to_payload(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_omits_absent_fields() {
        let timestamp = "2024-05-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let envelope = EventEnvelope::new("user.created", json!({"id": 7}), EmitOptions::default(), timestamp);

        let value: Value = serde_json::from_str(&envelope.to_payload().unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "user.created",
                "data": {"id": 7},
                "timestamp": "2024-05-01T12:00:00Z",
            })
        );
    }

    #[test]
    fn test_envelope_uses_camel_case_for_entity_fields() {
        let timestamp = Utc::now();
        let mut metadata = Map::new();
        metadata.insert("source".to_string(), json!("billing"));
        let options = EmitOptions {
            entity_id: Some("inv_1".to_string()),
            entity_type: Some("invoice".to_string()),
            metadata: Some(metadata),
        };
        let envelope = EventEnvelope::new("invoice.paid", json!(null), options, timestamp);

        let value: Value = serde_json::from_str(&envelope.to_payload().unwrap()).unwrap();
        assert_eq!(value["entityId"], "inv_1");
        assert_eq!(value["entityType"], "invoice");
        assert_eq!(value["metadata"]["source"], "billing");
        assert!(value.get("entity_id").is_none());
    }

    #[test]
    fn test_test_event() {
        let envelope = EventEnvelope::test_event(Utc::now());
        assert_eq!(envelope.event, TEST_EVENT);
        assert_eq!(envelope.data["message"], "This is a test webhook delivery");
    }
}
