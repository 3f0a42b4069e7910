//! The entry point business code uses.
//!
//! [`WebhookService::new`] wires the dispatcher, engine and scheduler around the
//! injected stores, transport and clock, and hands back the [`BackgroundServices`]
//! that must be spawned for deliveries to actually go out.

use std::sync::Arc;

use futures::Stream;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::config::WebhookConfig;
use crate::db::models::deliveries::Delivery;
use crate::db::{DeliveryStore, SubscriptionLookup};
use crate::errors::{Error, Result};
use crate::types::{DeliveryId, SubscriptionId, abbrev_uuid};
use crate::webhooks::clock::Clock;
use crate::webhooks::dispatcher::{DeliveryIntent, Dispatcher, run_workers};
use crate::webhooks::engine::DeliveryEngine;
use crate::webhooks::events::{EmitOptions, EventEnvelope};
use crate::webhooks::http::HttpClient;
use crate::webhooks::scheduler::RetryScheduler;
use crate::webhooks::stats::DeliveryStats;

#[derive(Clone)]
pub struct WebhookService {
    subscriptions: Arc<dyn SubscriptionLookup>,
    deliveries: Arc<dyn DeliveryStore>,
    dispatcher: Dispatcher,
    engine: DeliveryEngine,
    clock: Arc<dyn Clock>,
    enabled: bool,
}

/// Tasks that perform deliveries. Nothing is sent until these are spawned.
pub struct BackgroundServices {
    queue: mpsc::Receiver<DeliveryIntent>,
    engine: DeliveryEngine,
    max_concurrent_sends: usize,
    scheduler: RetryScheduler,
}

impl BackgroundServices {
    /// Spawn the delivery workers and the retry scheduler.
    ///
    /// Both stop when `shutdown` is cancelled; the workers first wait for in-flight
    /// attempts. Await the returned set to wait for them.
    pub fn spawn(self, shutdown: CancellationToken) -> JoinSet<()> {
        let mut tasks = JoinSet::new();
        tasks.spawn(run_workers(
            self.queue,
            self.engine,
            self.max_concurrent_sends,
            shutdown.clone(),
        ));
        tasks.spawn(self.scheduler.run(shutdown));
        tasks
    }

    /// Like [`BackgroundServices::spawn`], but the scheduler sweeps once per item of
    /// `ticks` instead of on a timer.
    pub fn spawn_with_ticks<S>(self, ticks: S, shutdown: CancellationToken) -> JoinSet<()>
    where
        S: Stream<Item = ()> + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        tasks.spawn(run_workers(
            self.queue,
            self.engine,
            self.max_concurrent_sends,
            shutdown.clone(),
        ));
        tasks.spawn(self.scheduler.run_with_ticks(ticks, shutdown));
        tasks
    }
}

impl WebhookService {
    pub fn new(
        subscriptions: Arc<dyn SubscriptionLookup>,
        deliveries: Arc<dyn DeliveryStore>,
        http: Arc<dyn HttpClient>,
        clock: Arc<dyn Clock>,
        config: &WebhookConfig,
    ) -> (Self, BackgroundServices) {
        let (queue_tx, queue_rx) = mpsc::channel(config.queue_capacity);
        let engine = DeliveryEngine::new(
            deliveries.clone(),
            http,
            clock.clone(),
            config.backoff(),
            config.user_agent(),
        );
        let dispatcher = Dispatcher::new(subscriptions.clone(), deliveries.clone(), clock.clone(), queue_tx);
        let scheduler = RetryScheduler::new(
            subscriptions.clone(),
            deliveries.clone(),
            engine.clone(),
            config.scheduler(),
        );

        let service = Self {
            subscriptions,
            deliveries,
            dispatcher,
            engine: engine.clone(),
            clock,
            enabled: config.enabled,
        };
        let background = BackgroundServices {
            queue: queue_rx,
            engine,
            max_concurrent_sends: config.max_concurrent_sends,
            scheduler,
        };
        (service, background)
    }

    /// Deliver `event` to every active subscription listening for it.
    ///
    /// Returns once the deliveries are created and queued, without waiting for any
    /// attempt. Delivery failures never surface here.
    #[instrument(skip(self, data, options), err)]
    pub async fn emit_event(&self, event: &str, data: Value, options: EmitOptions) -> Result<Vec<DeliveryId>> {
        if event.trim().is_empty() {
            return Err(Error::BadRequest {
                message: "Event name must not be empty".to_string(),
            });
        }
        if !self.enabled {
            tracing::debug!("Webhook delivery disabled, dropping event");
            return Ok(Vec::new());
        }

        let envelope = EventEnvelope::new(event, data, options, self.clock.now());
        self.dispatcher.dispatch(&envelope).await
    }

    /// Send a synthetic `webhook.test` event to one subscription and wait for the attempt.
    ///
    /// The subscription's event filter and status are ignored. A failed attempt is
    /// retried like any other delivery.
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&subscription_id)), err)]
    pub async fn test_delivery(&self, subscription_id: SubscriptionId) -> Result<Delivery> {
        let subscription = self
            .subscriptions
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| subscription_not_found(subscription_id))?;

        let event = EventEnvelope::test_event(self.clock.now());
        let delivery = self.dispatcher.create_for(&event, &subscription).await?;

        match self.engine.attempt(&delivery, &subscription).await? {
            Some(attempted) => Ok(attempted),
            // Someone else got to it first; report whatever is stored now
            None => self.get_delivery(delivery.id).await,
        }
    }

    /// Delivery counts and success rate for one subscription.
    #[instrument(skip(self), fields(subscription_id = %abbrev_uuid(&subscription_id)), err)]
    pub async fn delivery_stats(&self, subscription_id: SubscriptionId) -> Result<DeliveryStats> {
        if self.subscriptions.get_subscription(subscription_id).await?.is_none() {
            return Err(subscription_not_found(subscription_id));
        }
        let counts = self.deliveries.status_counts(subscription_id).await?;
        Ok(DeliveryStats::from(counts))
    }

    pub async fn get_delivery(&self, id: DeliveryId) -> Result<Delivery> {
        self.deliveries.get_delivery(id).await?.ok_or_else(|| Error::NotFound {
            resource: "Delivery".to_string(),
            id: id.to_string(),
        })
    }
}

fn subscription_not_found(id: SubscriptionId) -> Error {
    Error::NotFound {
        resource: "Subscription".to_string(),
        id: id.to_string(),
    }
}
