use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use axum_test::TestServer;
use chrono::Utc;

use crate::api::{self, AppState};
use crate::config::WebhookConfig;
use crate::db::memory::InMemoryStore;
use crate::db::models::subscriptions::{Subscription, SubscriptionStatus};
use crate::types::SubscriptionId;
use crate::webhooks::clock::ManualClock;
use crate::webhooks::http::MockHttpClient;
use crate::webhooks::{BackgroundServices, WebhookService};

pub struct TestApp {
    pub server: TestServer,
    pub store: Arc<InMemoryStore>,
    pub http: MockHttpClient,
    pub clock: Arc<ManualClock>,
    pub service: WebhookService,
    /// Subscribed to `user.created`, signed with `whsec_test`
    pub subscription: Subscription,
    /// Not spawned: queued deliveries stay pending unless a test spawns these.
    pub background: BackgroundServices,
}

pub fn create_test_subscription(url: &str, events: &[&str]) -> Subscription {
    Subscription {
        id: SubscriptionId::new(),
        url: url.to_string(),
        secret: Some("whsec_test".to_string()),
        headers: BTreeMap::new(),
        events: events.iter().map(|e| e.to_string()).collect::<BTreeSet<_>>(),
        max_retries: 3,
        timeout_seconds: 5,
        status: SubscriptionStatus::Active,
    }
}

/// Router over an in-memory store with one subscription and a mock transport.
pub fn test_app() -> TestApp {
    let subscription = create_test_subscription("https://hooks.example.com/in", &["user.created"]);
    let store = Arc::new(InMemoryStore::with_subscriptions([subscription.clone()]));
    let http = MockHttpClient::new();
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let (service, background) = WebhookService::new(
        store.clone(),
        store.clone(),
        Arc::new(http.clone()),
        clock.clone(),
        &WebhookConfig::default(),
    );

    let router = api::router(AppState {
        service: service.clone(),
        metrics: None,
    });
    let server = TestServer::new(router).expect("Failed to create test server");

    TestApp {
        server,
        store,
        http,
        clock,
        service,
        subscription,
        background,
    }
}
