//! # courier: outbound webhook delivery
//!
//! `courier` delivers internally originated business events to externally
//! registered HTTP endpoints. Each event is matched against the active
//! subscriptions listening for it, one delivery record is created per match, and
//! the payload is POSTed with an HMAC-SHA256 signature. Failed attempts are parked
//! with an exponential backoff and picked up again by a periodic retry sweep until
//! the subscription's retry budget is spent.
//!
//! ## Architecture
//!
//! - [`db`]: the narrow [`db::SubscriptionLookup`] / [`db::DeliveryStore`] traits,
//!   an in-memory store and (behind the `postgres` feature) a PostgreSQL store.
//! - [`webhooks`]: signing, the delivery engine, the dispatcher and its workers,
//!   the retry scheduler and the [`WebhookService`] facade.
//! - [`api`]: an axum router exposing the service over HTTP.
//! - [`config`] and [`telemetry`]: figment configuration and tracing setup.
//!
//! Delivery is at-least-once. Within one process the conditional
//! `Pending -> Retrying` transition guarantees a single attempt in flight per
//! delivery; several processes sharing a store may occasionally duplicate one.
//!
//! ## Embedding
//!
//! ```ignore
//! let (service, background) = WebhookService::new(store.clone(), store, http, clock, &config.webhooks);
//! let tasks = background.spawn(shutdown.clone());
//! service.emit_event("user.created", json!({"id": 1}), EmitOptions::default()).await?;
//! ```

pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod telemetry;
pub mod types;
pub mod webhooks;

#[cfg(test)]
mod test;

use std::sync::Arc;

use axum::Router;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::AppState;
use crate::db::memory::InMemoryStore;
use crate::db::{DeliveryStore, SubscriptionLookup};
use crate::types::abbrev_uuid;
use crate::webhooks::{ReqwestHttpClient, SystemClock};

pub use config::Config;
pub use webhooks::WebhookService;

/// Stores picked from the configuration.
struct Stores {
    subscriptions: Arc<dyn SubscriptionLookup>,
    deliveries: Arc<dyn DeliveryStore>,
}

#[cfg(feature = "postgres")]
async fn database_stores(config: &Config) -> anyhow::Result<Option<Stores>> {
    let Some(url) = &config.database_url else {
        return Ok(None);
    };

    info!("Connecting to PostgreSQL delivery store");
    let store = Arc::new(db::postgres::PostgresStore::connect(url).await?);
    if !config.subscriptions.is_empty() {
        warn!(
            count = config.subscriptions.len(),
            "Ignoring configured subscriptions; they are read from the database"
        );
    }
    Ok(Some(Stores {
        subscriptions: store.clone(),
        deliveries: store,
    }))
}

#[cfg(not(feature = "postgres"))]
async fn database_stores(_config: &Config) -> anyhow::Result<Option<Stores>> {
    Ok(None)
}

async fn build_stores(config: &Config) -> anyhow::Result<Stores> {
    if let Some(stores) = database_stores(config).await? {
        return Ok(stores);
    }

    let subscriptions: Vec<_> = config.subscriptions.iter().map(|s| s.to_subscription()).collect();
    for subscription in &subscriptions {
        info!(
            subscription_id = %abbrev_uuid(&subscription.id),
            url = %subscription.url,
            events = ?subscription.events,
            "Registered subscription"
        );
    }
    if subscriptions.is_empty() {
        warn!("No subscriptions configured; emitted events will not be delivered anywhere");
    }

    let store = Arc::new(InMemoryStore::with_subscriptions(subscriptions));
    Ok(Stores {
        subscriptions: store.clone(),
        deliveries: store,
    })
}

/// The assembled service: router, background tasks and their shutdown token.
pub struct Application {
    router: Router,
    config: Config,
    background: JoinSet<()>,
    shutdown: CancellationToken,
}

impl Application {
    /// Build the stores, the outbound client and the webhook service, and spawn the
    /// delivery workers and retry scheduler.
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        debug!("Starting courier with configuration: {:#?}", config);

        let metrics = if config.metrics_enabled {
            Some(install_metrics_recorder()?)
        } else {
            None
        };

        let stores = build_stores(&config).await?;
        let http = Arc::new(ReqwestHttpClient::new(config.webhooks.max_response_body_bytes)?);

        let (service, background) = WebhookService::new(
            stores.subscriptions,
            stores.deliveries,
            http,
            Arc::new(SystemClock),
            &config.webhooks,
        );

        let shutdown = CancellationToken::new();
        let background = background.spawn(shutdown.clone());
        if !config.webhooks.enabled {
            warn!("Webhook delivery is disabled; emitted events are dropped");
        }

        let router = api::router(AppState { service, metrics });

        Ok(Self {
            router,
            config,
            background,
            shutdown,
        })
    }

    /// Serve until `shutdown` resolves, then stop the background tasks and wait for
    /// in-flight attempts to finish.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!(
            "courier listening on http://{}, available at http://localhost:{}",
            bind_addr, self.config.port
        );

        axum::serve(listener, self.router.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("Stopping delivery workers and retry scheduler...");
        self.shutdown.cancel();
        let mut background = self.background;
        while let Some(result) = background.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Background task ended abnormally");
            }
        }

        Ok(())
    }
}

fn install_metrics_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(handle)
}
