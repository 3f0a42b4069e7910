use axum::{extract::State, http::StatusCode, response::Json};
use tracing::instrument;

use crate::{
    api::{
        AppState,
        models::events::{EmitEventRequest, EmitEventResponse},
    },
    errors::Result,
};

/// Emit an event to all matching subscriptions.
///
/// Responds as soon as deliveries are queued; outcomes are visible via `GET /deliveries/{id}`.
#[instrument(skip_all, fields(event = %request.event))]
pub async fn emit_event(
    State(state): State<AppState>,
    Json(request): Json<EmitEventRequest>,
) -> Result<(StatusCode, Json<EmitEventResponse>)> {
    let (event, data, options) = request.into_parts();
    let delivery_ids = state.service.emit_event(&event, data, options).await?;
    Ok((StatusCode::ACCEPTED, Json(EmitEventResponse { delivery_ids })))
}
