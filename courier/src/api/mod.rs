//! HTTP surface over [`WebhookService`].
//!
//! - `POST /events`: emit an event, `202` with the created delivery ids
//! - `POST /subscriptions/{id}/test`: send a test event and return the delivery
//! - `GET /subscriptions/{id}/stats`: delivery statistics
//! - `GET /deliveries/{id}`: one delivery record
//! - `GET /healthz`: liveness
//! - `GET /metrics`: Prometheus exposition, when a recorder handle is provided
//!
//! Subscription management and caller authentication live outside this service.

pub mod handlers;
pub mod models;

use axum::{
    Router,
    extract::State,
    routing::{get, post},
};
use metrics_exporter_prometheus::PrometheusHandle;
use tower_http::trace::TraceLayer;

use crate::webhooks::WebhookService;

#[derive(Clone)]
pub struct AppState {
    pub service: WebhookService,
    pub metrics: Option<PrometheusHandle>,
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/events", post(handlers::events::emit_event))
        .route("/subscriptions/{id}/test", post(handlers::subscriptions::test_subscription))
        .route("/subscriptions/{id}/stats", get(handlers::subscriptions::subscription_stats))
        .route("/deliveries/{id}", get(handlers::deliveries::get_delivery))
        .route("/healthz", get(|| async { "OK" }));

    if state.metrics.is_some() {
        router = router.route("/metrics", get(render_metrics));
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.as_ref().map(PrometheusHandle::render).unwrap_or_default()
}
