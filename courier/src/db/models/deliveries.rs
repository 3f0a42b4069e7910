//! Delivery records and their lifecycle status.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{DeliveryId, SubscriptionId};

/// Delivery lifecycle status.
///
/// ```text
/// Pending ──► Retrying ──► Success
///    ▲            │
///    └────────────┤ (failed, attempts left; next_retry_at set)
///                 ▼
///               Failed  (attempts exhausted)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting for its first attempt, or parked until `next_retry_at`
    Pending,
    /// An attempt is in flight
    Retrying,
    /// A 2xx response was received
    Success,
    /// All attempts exhausted without success
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "retrying" => Ok(Self::Retrying),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown delivery status: {}", s)),
        }
    }
}

/// The record of sending one event to one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub event: String,
    /// Serialized event envelope, captured once at creation. Every attempt sends these bytes.
    pub payload: String,
    pub status: DeliveryStatus,
    pub attempts: u32,
    pub response_status: Option<u16>,
    pub response_body: Option<String>,
    pub response_headers: Option<BTreeMap<String, String>>,
    pub error_message: Option<String>,
    /// Set only while parked in `Pending` after a failed attempt.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When the most recent attempt started.
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// A fresh `Pending` delivery with no attempts.
    pub fn new(id: DeliveryId, request: &DeliveryCreateDBRequest) -> Self {
        Self {
            id,
            subscription_id: request.subscription_id,
            event: request.event.clone(),
            payload: request.payload.clone(),
            status: DeliveryStatus::Pending,
            attempts: 0,
            response_status: None,
            response_body: None,
            response_headers: None,
            error_message: None,
            next_retry_at: None,
            last_attempt_at: None,
            delivered_at: None,
            created_at: request.created_at,
            updated_at: request.created_at,
        }
    }

    /// Whether the scheduler may pick this delivery up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_retry_at.is_some_and(|at| at <= now)
    }

    /// Parse the stored payload back into a JSON value.
    pub fn payload_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::from_str(&self.payload)
    }
}

/// Request to create a delivery.
#[derive(Debug, Clone)]
pub struct DeliveryCreateDBRequest {
    pub subscription_id: SubscriptionId,
    pub event: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

/// Per-status delivery counts for one subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStatusCounts {
    pub pending: u64,
    pub retrying: u64,
    pub success: u64,
    pub failed: u64,
}

impl DeliveryStatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.retrying + self.success + self.failed
    }

    pub fn record(&mut self, status: DeliveryStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: DeliveryStatus, count: u64) {
        match status {
            DeliveryStatus::Pending => self.pending += count,
            DeliveryStatus::Retrying => self.retrying += count,
            DeliveryStatus::Success => self.success += count,
            DeliveryStatus::Failed => self.failed += count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn delivery() -> Delivery {
        Delivery::new(
            DeliveryId::new(),
            &DeliveryCreateDBRequest {
                subscription_id: SubscriptionId::new(),
                event: "user.created".to_string(),
                payload: r#"{"event":"user.created","data":{}}"#.to_string(),
                created_at: Utc::now(),
            },
        )
    }

    #[test]
    fn test_new_delivery_is_pending_without_retry_time() {
        let d = delivery();
        assert_eq!(d.status, DeliveryStatus::Pending);
        assert_eq!(d.attempts, 0);
        assert!(d.next_retry_at.is_none());
        assert_eq!(d.created_at, d.updated_at);
    }

    #[test]
    fn test_is_due() {
        let now = Utc::now();
        let mut d = delivery();
        // Fresh deliveries are handed to workers, not to the scheduler
        assert!(!d.is_due(now));

        d.next_retry_at = Some(now);
        assert!(d.is_due(now));

        d.next_retry_at = Some(now + Duration::seconds(1));
        assert!(!d.is_due(now));

        d.next_retry_at = Some(now - Duration::seconds(1));
        d.status = DeliveryStatus::Retrying;
        assert!(!d.is_due(now));
    }

    #[test]
    fn test_status_counts() {
        let mut counts = DeliveryStatusCounts::default();
        counts.record(DeliveryStatus::Pending);
        counts.record(DeliveryStatus::Success);
        counts.record(DeliveryStatus::Success);
        counts.add(DeliveryStatus::Failed, 3);
        assert_eq!(counts.total(), 6);
        assert_eq!(counts.success, 2);
        assert_eq!(counts.failed, 3);
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("retrying".parse::<DeliveryStatus>().unwrap(), DeliveryStatus::Retrying);
        assert!("exhausted".parse::<DeliveryStatus>().is_err());
        assert!(DeliveryStatus::Failed.is_terminal());
        assert!(!DeliveryStatus::Pending.is_terminal());
    }

    #[test]
    fn test_payload_json() {
        let d = delivery();
        assert_eq!(d.payload_json().unwrap()["event"], "user.created");
    }
}
