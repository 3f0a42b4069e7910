//! Subscription records as this crate sees them (read-only).

use std::collections::{BTreeMap, BTreeSet};
use std::ops::RangeInclusive;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::SubscriptionId;

/// Allowed range for [`Subscription::max_retries`].
pub const MAX_RETRIES_RANGE: RangeInclusive<u32> = 1..=10;

/// Allowed range for [`Subscription::timeout_seconds`].
pub const TIMEOUT_SECONDS_RANGE: RangeInclusive<u32> = 5..=300;

/// Lifecycle status of a subscription. Only `Active` subscriptions receive events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    Inactive,
    Failed,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Failed => "failed",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SubscriptionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Unknown subscription status: {}", s)),
        }
    }
}

/// Reasons a subscription record is unusable for delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidSubscription {
    #[error("url {url:?} is not an absolute http(s) URL")]
    Url { url: String },

    #[error("max_retries {0} is outside 1..=10")]
    MaxRetries(u32),

    #[error("timeout_seconds {0} is outside 5..=300")]
    TimeoutSeconds(u32),
}

/// A registered destination eligible to receive matching events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub url: String,
    /// HMAC secret. When absent, deliveries are sent unsigned.
    pub secret: Option<String>,
    /// Extra headers sent with every delivery. `X-Webhook-*` names are ignored.
    pub headers: BTreeMap<String, String>,
    /// Event names this subscription receives (exact match).
    pub events: BTreeSet<String>,
    pub max_retries: u32,
    pub timeout_seconds: u32,
    pub status: SubscriptionStatus,
}

impl Subscription {
    /// Total number of attempts a delivery to this subscription may consume.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.timeout_seconds))
    }

    pub fn is_active(&self) -> bool {
        self.status == SubscriptionStatus::Active
    }

    /// Check if this subscription should receive the given event.
    pub fn accepts_event(&self, event: &str) -> bool {
        self.is_active() && self.events.contains(event)
    }

    pub fn validate(&self) -> Result<(), InvalidSubscription> {
        let url_ok = url::Url::parse(&self.url)
            .map(|u| matches!(u.scheme(), "http" | "https") && u.has_host())
            .unwrap_or(false);
        if !url_ok {
            return Err(InvalidSubscription::Url { url: self.url.clone() });
        }
        if !MAX_RETRIES_RANGE.contains(&self.max_retries) {
            return Err(InvalidSubscription::MaxRetries(self.max_retries));
        }
        if !TIMEOUT_SECONDS_RANGE.contains(&self.timeout_seconds) {
            return Err(InvalidSubscription::TimeoutSeconds(self.timeout_seconds));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscription() -> Subscription {
        Subscription {
            id: SubscriptionId::new(),
            url: "https://hooks.example.com/in".to_string(),
            secret: None,
            headers: BTreeMap::new(),
            events: BTreeSet::from(["user.created".to_string()]),
            max_retries: 3,
            timeout_seconds: 30,
            status: SubscriptionStatus::Active,
        }
    }

    #[test]
    fn test_accepts_event_exact_match_only() {
        let sub = subscription();
        assert!(sub.accepts_event("user.created"));
        assert!(!sub.accepts_event("user.created.v2"));
        assert!(!sub.accepts_event("user.*"));
    }

    #[test]
    fn test_inactive_subscription_accepts_nothing() {
        let mut sub = subscription();
        sub.status = SubscriptionStatus::Inactive;
        assert!(!sub.accepts_event("user.created"));
        sub.status = SubscriptionStatus::Failed;
        assert!(!sub.accepts_event("user.created"));
    }

    #[test]
    fn test_validate_ranges() {
        let mut sub = subscription();
        assert!(sub.validate().is_ok());

        sub.max_retries = 0;
        assert_eq!(sub.validate(), Err(InvalidSubscription::MaxRetries(0)));
        sub.max_retries = 11;
        assert_eq!(sub.validate(), Err(InvalidSubscription::MaxRetries(11)));
        sub.max_retries = 10;

        sub.timeout_seconds = 4;
        assert_eq!(sub.validate(), Err(InvalidSubscription::TimeoutSeconds(4)));
        sub.timeout_seconds = 301;
        assert_eq!(sub.validate(), Err(InvalidSubscription::TimeoutSeconds(301)));
    }

    #[test]
    fn test_validate_url() {
        let mut sub = subscription();
        sub.url = "ftp://example.com".to_string();
        assert!(matches!(sub.validate(), Err(InvalidSubscription::Url { .. })));
        sub.url = "not a url".to_string();
        assert!(matches!(sub.validate(), Err(InvalidSubscription::Url { .. })));
        sub.url = "http://localhost:8080/hook".to_string();
        assert!(sub.validate().is_ok());
    }

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [SubscriptionStatus::Active, SubscriptionStatus::Inactive, SubscriptionStatus::Failed] {
            assert_eq!(status.as_str().parse::<SubscriptionStatus>().unwrap(), status);
        }
        assert!("paused".parse::<SubscriptionStatus>().is_err());
    }
}
