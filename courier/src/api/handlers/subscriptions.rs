use axum::{
    extract::{Path, State},
    response::Json,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    api::{AppState, models::deliveries::DeliveryResponse},
    errors::Result,
    types::SubscriptionId,
    webhooks::DeliveryStats,
};

/// Send a `webhook.test` event to one subscription and return the resulting delivery.
#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn test_subscription(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<DeliveryResponse>> {
    let delivery = state.service.test_delivery(SubscriptionId::from(id)).await?;
    Ok(Json(delivery.into()))
}

#[instrument(skip_all, fields(subscription_id = %id))]
pub async fn subscription_stats(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<DeliveryStats>> {
    let stats = state.service.delivery_stats(SubscriptionId::from(id)).await?;
    Ok(Json(stats))
}
