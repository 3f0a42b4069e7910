//! Store interfaces consumed by the delivery core, plus implementations.
//!
//! The core only ever talks to two narrow traits:
//!
//! - [`SubscriptionLookup`]: read-only access to subscription records
//! - [`DeliveryStore`]: create, conditionally update and query deliveries
//!
//! [`memory::InMemoryStore`] implements both and backs the tests and the
//! database-less binary. With the `postgres` feature, [`postgres::PostgresStore`]
//! implements both on top of sqlx.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub mod errors;
pub mod memory;
pub mod models;
#[cfg(feature = "postgres")]
pub mod postgres;

use crate::types::{DeliveryId, SubscriptionId};
use errors::Result;
use models::deliveries::{Delivery, DeliveryCreateDBRequest, DeliveryStatus, DeliveryStatusCounts};
use models::subscriptions::Subscription;

/// Read-only access to subscriptions.
#[async_trait]
pub trait SubscriptionLookup: Send + Sync {
    /// Get a subscription by ID, whatever its status.
    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>>;

    /// All active subscriptions whose event filter contains `event` (exact match).
    async fn active_subscriptions_for_event(&self, event: &str) -> Result<Vec<Subscription>>;
}

/// Persistence for delivery records.
///
/// Updates are conditional: [`DeliveryStore::transition`] only writes when the stored
/// record still has the expected status and attempt count. That compare-and-set is
/// what keeps a single attempt in flight per delivery.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    /// Create a new `Pending` delivery.
    async fn create_delivery(&self, request: &DeliveryCreateDBRequest) -> Result<Delivery>;

    /// Get a delivery by ID.
    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>>;

    /// Replace the stored record with `delivery` if it is currently in status `from`
    /// with `from_attempts` attempts. Returns whether the write happened.
    async fn transition(&self, from: DeliveryStatus, from_attempts: u32, delivery: &Delivery) -> Result<bool>;

    /// Up to `limit` `Pending` deliveries with `next_retry_at <= now`, earliest first.
    async fn due_deliveries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>>;

    /// Up to `limit` `Retrying` deliveries whose attempt started at or before `started_before`.
    async fn stale_attempts(&self, started_before: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>>;

    /// Up to `limit` never-attempted `Pending` deliveries created at or before `created_before`.
    ///
    /// These are deliveries whose queued intent was lost, e.g. to a restart.
    async fn unattempted_deliveries(&self, created_before: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>>;

    /// All deliveries for a subscription, newest first.
    async fn deliveries_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<Delivery>>;

    /// Count a subscription's deliveries by status.
    async fn status_counts(&self, subscription_id: SubscriptionId) -> Result<DeliveryStatusCounts> {
        let deliveries = self.deliveries_for_subscription(subscription_id).await?;
        let mut counts = DeliveryStatusCounts::default();
        for delivery in &deliveries {
            counts.record(delivery.status);
        }
        Ok(counts)
    }
}
