//! In-process store backing tests and the database-less binary.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::errors::Result;
use super::models::deliveries::{Delivery, DeliveryCreateDBRequest, DeliveryStatus};
use super::models::subscriptions::{Subscription, SubscriptionStatus};
use super::{DeliveryStore, SubscriptionLookup};
use crate::types::{DeliveryId, SubscriptionId};

/// Subscriptions and deliveries held in memory behind `parking_lot` locks.
///
/// Locks are never held across an `.await`.
#[derive(Default)]
pub struct InMemoryStore {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    deliveries: RwLock<HashMap<DeliveryId, Delivery>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_subscriptions(subscriptions: impl IntoIterator<Item = Subscription>) -> Self {
        let store = Self::new();
        for subscription in subscriptions {
            store.upsert_subscription(subscription);
        }
        store
    }

    /// Insert or replace a subscription.
    pub fn upsert_subscription(&self, subscription: Subscription) {
        self.subscriptions.write().insert(subscription.id, subscription);
    }

    pub fn remove_subscription(&self, id: SubscriptionId) -> Option<Subscription> {
        self.subscriptions.write().remove(&id)
    }

    /// Change a subscription's status. Returns false if it doesn't exist.
    pub fn set_subscription_status(&self, id: SubscriptionId, status: SubscriptionStatus) -> bool {
        match self.subscriptions.write().get_mut(&id) {
            Some(subscription) => {
                subscription.status = status;
                true
            }
            None => false,
        }
    }

    /// Insert a delivery record as-is, bypassing the lifecycle.
    pub fn insert_delivery(&self, delivery: Delivery) {
        self.deliveries.write().insert(delivery.id, delivery);
    }

    /// Snapshot of every stored delivery, oldest first.
    pub fn all_deliveries(&self) -> Vec<Delivery> {
        let mut deliveries: Vec<Delivery> = self.deliveries.read().values().cloned().collect();
        deliveries.sort_by_key(|d| (d.created_at, d.id));
        deliveries
    }
}

#[async_trait]
impl SubscriptionLookup for InMemoryStore {
    async fn get_subscription(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        Ok(self.subscriptions.read().get(&id).cloned())
    }

    async fn active_subscriptions_for_event(&self, event: &str) -> Result<Vec<Subscription>> {
        let mut matches: Vec<Subscription> = self
            .subscriptions
            .read()
            .values()
            .filter(|s| s.accepts_event(event))
            .cloned()
            .collect();
        matches.sort_by_key(|s| s.id);
        Ok(matches)
    }
}

#[async_trait]
impl DeliveryStore for InMemoryStore {
    async fn create_delivery(&self, request: &DeliveryCreateDBRequest) -> Result<Delivery> {
        let delivery = Delivery::new(DeliveryId::new(), request);
        self.deliveries.write().insert(delivery.id, delivery.clone());
        Ok(delivery)
    }

    async fn get_delivery(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        Ok(self.deliveries.read().get(&id).cloned())
    }

    async fn transition(&self, from: DeliveryStatus, from_attempts: u32, delivery: &Delivery) -> Result<bool> {
        let mut deliveries = self.deliveries.write();
        match deliveries.get_mut(&delivery.id) {
            Some(stored) if stored.status == from && stored.attempts == from_attempts => {
                *stored = delivery.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn due_deliveries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>> {
        let mut due: Vec<Delivery> = self.deliveries.read().values().filter(|d| d.is_due(now)).cloned().collect();
        due.sort_by_key(|d| (d.next_retry_at, d.created_at, d.id));
        due.truncate(limit);
        Ok(due)
    }

    async fn stale_attempts(&self, started_before: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>> {
        let mut stale: Vec<Delivery> = self
            .deliveries
            .read()
            .values()
            .filter(|d| d.status == DeliveryStatus::Retrying && d.last_attempt_at.is_some_and(|at| at <= started_before))
            .cloned()
            .collect();
        stale.sort_by_key(|d| (d.last_attempt_at, d.id));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn unattempted_deliveries(&self, created_before: DateTime<Utc>, limit: usize) -> Result<Vec<Delivery>> {
        let mut unattempted: Vec<Delivery> = self
            .deliveries
            .read()
            .values()
            .filter(|d| {
                d.status == DeliveryStatus::Pending && d.attempts == 0 && d.next_retry_at.is_none() && d.created_at <= created_before
            })
            .cloned()
            .collect();
        unattempted.sort_by_key(|d| (d.created_at, d.id));
        unattempted.truncate(limit);
        Ok(unattempted)
    }

    async fn deliveries_for_subscription(&self, subscription_id: SubscriptionId) -> Result<Vec<Delivery>> {
        let mut deliveries: Vec<Delivery> = self
            .deliveries
            .read()
            .values()
            .filter(|d| d.subscription_id == subscription_id)
            .cloned()
            .collect();
        deliveries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(deliveries)
    }
}
