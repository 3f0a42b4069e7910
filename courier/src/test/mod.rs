//! End-to-end delivery flows through [`WebhookService`] with its background tasks running.

pub mod utils;

pub use utils::{TestApp, create_test_subscription, test_app};

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::config::WebhookConfig;
use crate::db::DeliveryStore;
use crate::db::memory::InMemoryStore;
use crate::db::models::deliveries::{Delivery, DeliveryStatus};
use crate::types::DeliveryId;
use crate::webhooks::engine::{DELIVERY_HEADER, EVENT_HEADER, SIGNATURE_HEADER};
use crate::webhooks::http::{HttpResponse, ReqwestHttpClient};
use crate::webhooks::{Clock, EmitOptions, SystemClock, WebhookService, signing};

/// Poll the store until the delivery satisfies `done`.
async fn wait_for(store: &InMemoryStore, id: DeliveryId, done: impl Fn(&Delivery) -> bool) -> Delivery {
    for _ in 0..500 {
        if let Some(delivery) = store.get_delivery(id).await.unwrap() {
            if done(&delivery) {
                return delivery;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("delivery {id} never reached the expected state");
}

#[test_log::test(tokio::test)]
async fn test_e2e_signed_delivery_over_http() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/hooks"))
        .respond_with(ResponseTemplate::new(200).set_body_string("received"))
        .expect(1)
        .mount(&mock_server)
        .await;

    let subscription = create_test_subscription(&format!("{}/hooks", mock_server.uri()), &["invoice.paid"]);
    let store = Arc::new(InMemoryStore::with_subscriptions([subscription.clone()]));
    let config = WebhookConfig::default();
    let (service, background) = WebhookService::new(
        store.clone(),
        store.clone(),
        Arc::new(ReqwestHttpClient::new(config.max_response_body_bytes).unwrap()),
        Arc::new(SystemClock),
        &config,
    );
    let shutdown = CancellationToken::new();
    let mut tasks = background.spawn(shutdown.clone());

    let options = EmitOptions {
        entity_id: Some("inv_42".to_string()),
        entity_type: Some("invoice".to_string()),
        metadata: None,
    };
    let ids = service
        .emit_event("invoice.paid", json!({"amount": 1200, "currency": "EUR"}), options)
        .await
        .unwrap();
    assert_eq!(ids.len(), 1);

    let delivery = wait_for(&store, ids[0], |d| d.status == DeliveryStatus::Success).await;
    assert_eq!(delivery.attempts, 1);
    assert_eq!(delivery.response_status, Some(200));
    assert_eq!(delivery.response_body.as_deref(), Some("received"));
    assert!(delivery.delivered_at.is_some());

    let requests = mock_server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 1);
    let request = &requests[0];
    let header = |name: &str| request.headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);

    assert_eq!(header("content-type").as_deref(), Some("application/json"));
    assert_eq!(header(EVENT_HEADER).as_deref(), Some("invoice.paid"));
    assert_eq!(header(DELIVERY_HEADER), Some(ids[0].to_string()));
    let signature = header(SIGNATURE_HEADER).unwrap();
    assert!(signing::verify_signature("whsec_test", &request.body, &signature));

    let body: Value = serde_json::from_slice(&request.body).unwrap();
    assert_eq!(body["event"], "invoice.paid");
    assert_eq!(body["data"]["amount"], 1200);
    assert_eq!(body["entityId"], "inv_42");
    assert_eq!(body["entityType"], "invoice");
    assert!(body.get("metadata").is_none());
    assert_eq!(request.body, delivery.payload.as_bytes());

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
}

#[test_log::test(tokio::test)]
async fn test_e2e_fan_out_is_isolated() {
    let mock_server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/broken"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(300)))
        .mount(&mock_server)
        .await;
    Mock::given(method("POST"))
        .and(path("/fast"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&mock_server)
        .await;

    let broken = create_test_subscription(&format!("{}/broken", mock_server.uri()), &["order.created"]);
    let slow = create_test_subscription(&format!("{}/slow", mock_server.uri()), &["order.created"]);
    let fast = create_test_subscription(&format!("{}/fast", mock_server.uri()), &["order.created"]);
    let store = Arc::new(InMemoryStore::with_subscriptions([broken.clone(), slow.clone(), fast.clone()]));
    let config = WebhookConfig::default();
    let (service, background) = WebhookService::new(
        store.clone(),
        store.clone(),
        Arc::new(ReqwestHttpClient::new(config.max_response_body_bytes).unwrap()),
        Arc::new(SystemClock),
        &config,
    );
    let shutdown = CancellationToken::new();
    let mut tasks = background.spawn(shutdown.clone());

    let ids = service
        .emit_event("order.created", json!({"orderId": 7}), EmitOptions::default())
        .await
        .unwrap();
    assert_eq!(ids.len(), 3);

    let mut by_subscription = std::collections::HashMap::new();
    for id in ids {
        let delivery = wait_for(&store, id, |d| d.attempts == 1 && d.status != DeliveryStatus::Retrying).await;
        by_subscription.insert(delivery.subscription_id, delivery);
    }

    let failed = &by_subscription[&broken.id];
    assert_eq!(failed.status, DeliveryStatus::Pending);
    assert_eq!(failed.response_status, Some(500));
    assert!(failed.next_retry_at.is_some());

    assert_eq!(by_subscription[&slow.id].status, DeliveryStatus::Success);
    assert_eq!(by_subscription[&fast.id].status, DeliveryStatus::Success);
    assert_eq!(by_subscription[&fast.id].response_status, Some(204));

    // Every delivery carries the same payload bytes
    let payloads: std::collections::HashSet<&str> = by_subscription.values().map(|d| d.payload.as_str()).collect();
    assert_eq!(payloads.len(), 1);

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
}

#[test_log::test(tokio::test)]
async fn test_e2e_retries_until_exhausted() {
    let TestApp {
        store,
        http,
        clock,
        service,
        mut subscription,
        background,
        ..
    } = test_app();
    subscription.max_retries = 2;
    store.upsert_subscription(subscription.clone());
    http.set_fallback(Ok(HttpResponse::new(503)));

    let (tick_tx, tick_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown = CancellationToken::new();
    let mut tasks = background.spawn_with_ticks(tokio_stream::wrappers::ReceiverStream::new(tick_rx), shutdown.clone());

    let ids = service
        .emit_event("user.created", json!({"id": 1}), EmitOptions::default())
        .await
        .unwrap();
    let id = ids[0];

    // First attempt comes from the worker
    let first = wait_for(&store, id, |d| d.attempts == 1 && d.status == DeliveryStatus::Pending).await;
    assert_eq!(first.next_retry_at, Some(clock.now() + chrono::Duration::minutes(2)));

    // Not due yet: a tick does nothing
    tick_tx.send(()).await.unwrap();
    clock.advance(chrono::Duration::minutes(1));
    tick_tx.send(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(http.call_count(), 1);

    clock.advance(chrono::Duration::minutes(1));
    tick_tx.send(()).await.unwrap();
    let second = wait_for(&store, id, |d| d.attempts == 2 && d.status == DeliveryStatus::Pending).await;
    assert_eq!(second.next_retry_at, Some(clock.now() + chrono::Duration::minutes(4)));

    clock.advance(chrono::Duration::minutes(4));
    tick_tx.send(()).await.unwrap();
    let last = wait_for(&store, id, |d| d.status == DeliveryStatus::Failed).await;
    assert_eq!(last.attempts, 3);
    assert!(last.next_retry_at.is_none());
    assert_eq!(last.error_message.as_deref(), Some("HTTP 503 Service Unavailable"));

    clock.advance(chrono::Duration::hours(2));
    tick_tx.send(()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(http.call_count(), 3);

    let stats = service.delivery_stats(subscription.id).await.unwrap();
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.success_rate, 0.0);

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
}

#[test_log::test(tokio::test)]
async fn test_e2e_recovers_after_transient_failure() {
    let TestApp {
        store,
        http,
        clock,
        service,
        subscription,
        background,
        ..
    } = test_app();
    http.add_response(&subscription.url, Ok(HttpResponse::new(429)));

    let (tick_tx, tick_rx) = tokio::sync::mpsc::channel::<()>(1);
    let shutdown = CancellationToken::new();
    let mut tasks = background.spawn_with_ticks(tokio_stream::wrappers::ReceiverStream::new(tick_rx), shutdown.clone());

    let id = service
        .emit_event("user.created", json!({}), EmitOptions::default())
        .await
        .unwrap()[0];
    let parked = wait_for(&store, id, |d| d.attempts == 1 && d.status == DeliveryStatus::Pending).await;
    assert_eq!(parked.error_message.as_deref(), Some("HTTP 429 Too Many Requests"));

    clock.set(parked.next_retry_at.unwrap());
    tick_tx.send(()).await.unwrap();
    let delivered = wait_for(&store, id, |d| d.status == DeliveryStatus::Success).await;
    assert_eq!(delivered.attempts, 2);
    assert!(delivered.error_message.is_none());
    assert_eq!(delivered.response_status, Some(200));

    // Both attempts sent identical bytes
    let calls = http.calls();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0].body, calls[1].body);
    assert_eq!(calls[0].header(SIGNATURE_HEADER), calls[1].header(SIGNATURE_HEADER));

    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
}
