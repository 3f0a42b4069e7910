use axum::{
    extract::{Path, State},
    response::Json,
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    api::{AppState, models::deliveries::DeliveryResponse},
    errors::Result,
    types::DeliveryId,
};

#[instrument(skip_all, fields(delivery_id = %id))]
pub async fn get_delivery(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<DeliveryResponse>> {
    let delivery = state.service.get_delivery(DeliveryId::from(id)).await?;
    Ok(Json(delivery.into()))
}

#[cfg(test)]
mod tests {
    use crate::test::test_app;
    use axum::http::StatusCode;
    use serde_json::{Value, json};

    #[tokio::test]
    async fn test_get_delivery() {
        let app = test_app();
        let emitted: Value = app
            .server
            .post("/events")
            .json(&json!({"event": "user.created", "data": {"id": 9}}))
            .await
            .json();
        let id = emitted["deliveryIds"][0].as_str().unwrap().to_string();

        let response = app.server.get(&format!("/deliveries/{id}")).await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["id"], id);
        assert_eq!(body["subscriptionId"], app.subscription.id.to_string());
        assert_eq!(body["status"], "pending");
        assert_eq!(body["payload"]["data"]["id"], 9);
    }

    #[tokio::test]
    async fn test_get_missing_delivery() {
        let app = test_app();
        let response = app.server.get(&format!("/deliveries/{}", uuid::Uuid::new_v4())).await;
        response.assert_status(StatusCode::NOT_FOUND);
        let body: Value = response.json();
        assert!(body["message"].as_str().unwrap().starts_with("Delivery with ID"));
    }

    #[tokio::test]
    async fn test_healthz() {
        let app = test_app();
        let response = app.server.get("/healthz").await;
        response.assert_status_ok();
        response.assert_text("OK");
    }
}
