use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::db::models::deliveries::{Delivery, DeliveryStatus};
use crate::types::{DeliveryId, SubscriptionId};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryResponse {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event: String,
    /// The delivered envelope. Falls back to the raw string if it is not valid JSON.
    pub payload: Value,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub response_headers: Option<BTreeMap<String, String>>,
    pub error_message: Option<String>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Delivery> for DeliveryResponse {
    fn from(delivery: Delivery) -> Self {
        let payload = delivery
            .payload_json()
            .unwrap_or_else(|_| Value::String(delivery.payload.clone()));
        Self {
            id: delivery.id,
            subscription_id: delivery.subscription_id,
            event: delivery.event,
            payload,
            status: delivery.status,
            attempts: delivery.attempts,
            response_status: delivery.response_status,
            response_body: delivery.response_body,
            response_headers: delivery.response_headers,
            error_message: delivery.error_message,
            next_retry_at: delivery.next_retry_at,
            last_attempt_at: delivery.last_attempt_at,
            delivered_at: delivery.delivered_at,
            created_at: delivery.created_at,
            updated_at: delivery.updated_at,
        }
    }
}
