//! Event fan-out and the delivery worker pool.
//!
//! ```text
//! Dispatcher::dispatch(event)
//!   ├─ subscriptions.active_subscriptions_for_event()
//!   └─ for each match:
//!        ├─ deliveries.create_delivery()     // Pending, attempts 0, payload snapshot
//!        └─ queue.send(intent) ──────────────────────────────┐
//!                                                            │
//!              ┌─────────────────────────────────────────────┘
//!              ▼
//!         run_workers (spawned task):
//!              ├─ recv from queue
//!              ├─ acquire semaphore permit (caps concurrent sends)
//!              └─ spawn engine.attempt()
//! ```
//!
//! `dispatch` returns as soon as the intents are queued; callers never wait on the
//! network. A failed first attempt parks the delivery for the retry scheduler.

use std::sync::Arc;

use metrics::counter;
use tokio::sync::{Semaphore, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::db::models::deliveries::{Delivery, DeliveryCreateDBRequest};
use crate::db::models::subscriptions::Subscription;
use crate::db::{DeliveryStore, SubscriptionLookup};
use crate::errors::{Error, Result};
use crate::types::{DeliveryId, abbrev_uuid};
use crate::webhooks::clock::Clock;
use crate::webhooks::engine::DeliveryEngine;
use crate::webhooks::events::EventEnvelope;

/// A created delivery waiting for its first attempt.
#[derive(Debug, Clone)]
pub struct DeliveryIntent {
    pub delivery: Delivery,
    pub subscription: Subscription,
}

#[derive(Clone)]
pub struct Dispatcher {
    subscriptions: Arc<dyn SubscriptionLookup>,
    deliveries: Arc<dyn DeliveryStore>,
    clock: Arc<dyn Clock>,
    queue: mpsc::Sender<DeliveryIntent>,
}

impl Dispatcher {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionLookup>,
        deliveries: Arc<dyn DeliveryStore>,
        clock: Arc<dyn Clock>,
        queue: mpsc::Sender<DeliveryIntent>,
    ) -> Self {
        Self {
            subscriptions,
            deliveries,
            clock,
            queue,
        }
    }

    /// Create and queue one delivery per active subscription listening for `event`.
    ///
    /// A store error for one subscription is logged and skipped; the others still get
    /// their delivery. Returns the ids of the deliveries that were created.
    #[instrument(skip(self, event), fields(event = %event.event), err)]
    pub async fn dispatch(&self, event: &EventEnvelope) -> Result<Vec<DeliveryId>> {
        let subscriptions = self.subscriptions.active_subscriptions_for_event(&event.event).await?;
        if subscriptions.is_empty() {
            tracing::debug!("No subscriptions for event");
            return Ok(Vec::new());
        }

        let payload = event
            .to_payload()
            .map_err(|e| anyhow::anyhow!("Failed to serialize event payload: {e}"))?;

        let mut intents = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            match self.create(&event.event, &payload, &subscription).await {
                Ok(delivery) => intents.push(DeliveryIntent { delivery, subscription }),
                Err(e) => {
                    tracing::warn!(
                        subscription_id = %abbrev_uuid(&subscription.id),
                        error = %e,
                        "Failed to create delivery, skipping subscription"
                    );
                }
            }
        }

        let ids: Vec<DeliveryId> = intents.iter().map(|i| i.delivery.id).collect();
        for intent in intents {
            self.enqueue(intent).await?;
        }

        tracing::debug!(count = ids.len(), "Queued webhook deliveries");
        Ok(ids)
    }

    /// Create a delivery of `event` for exactly `subscription`, ignoring its event
    /// filter and status. The delivery is not queued.
    pub async fn create_for(&self, event: &EventEnvelope, subscription: &Subscription) -> Result<Delivery> {
        let payload = event
            .to_payload()
            .map_err(|e| anyhow::anyhow!("Failed to serialize event payload: {e}"))?;
        self.create(&event.event, &payload, subscription).await
    }

    async fn create(&self, event: &str, payload: &str, subscription: &Subscription) -> Result<Delivery> {
        let delivery = self
            .deliveries
            .create_delivery(&DeliveryCreateDBRequest {
                subscription_id: subscription.id,
                event: event.to_string(),
                payload: payload.to_string(),
                created_at: self.clock.now(),
            })
            .await?;
        counter!("courier_webhook_deliveries_created_total").increment(1);
        Ok(delivery)
    }

    async fn enqueue(&self, intent: DeliveryIntent) -> Result<()> {
        let delivery_id = intent.delivery.id;
        self.queue.send(intent).await.map_err(|_| {
            tracing::warn!(delivery_id = %abbrev_uuid(&delivery_id), "Delivery queue closed, intent dropped");
            Error::QueueClosed
        })
    }
}

// --- Worker task ---

/// Long-lived task that receives intents and runs first attempts.
///
/// At most `max_concurrent_sends` attempts are in flight at once. On shutdown the
/// task stops taking new intents and waits for in-flight attempts to finish.
pub async fn run_workers(
    mut rx: mpsc::Receiver<DeliveryIntent>,
    engine: DeliveryEngine,
    max_concurrent_sends: usize,
    shutdown: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent_sends));

    loop {
        let intent = tokio::select! {
            intent = rx.recv() => {
                match intent {
                    Some(i) => i,
                    None => {
                        tracing::debug!("Delivery queue closed, shutting down workers");
                        break;
                    }
                }
            }
            _ = shutdown.cancelled() => {
                tracing::debug!("Delivery workers received shutdown signal");
                break;
            }
        };

        let permit = match semaphore.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => {
                tracing::warn!("Delivery worker semaphore closed");
                break;
            }
        };

        let engine = engine.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let DeliveryIntent { delivery, subscription } = intent;
            if let Err(e) = engine.attempt(&delivery, &subscription).await {
                tracing::warn!(
                    delivery_id = %abbrev_uuid(&delivery.id),
                    subscription_id = %abbrev_uuid(&subscription.id),
                    error = %e,
                    "Failed to record first webhook attempt"
                );
            }
        });
    }

    // Drain: every permit back means every spawned attempt has finished
    let permits = u32::try_from(max_concurrent_sends).unwrap_or(u32::MAX);
    let _ = semaphore.acquire_many(permits).await;
    tracing::debug!("Delivery worker task exited");
}
