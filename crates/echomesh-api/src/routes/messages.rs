//! Inbound envelope endpoint.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use echomesh_common::error::CoreError;
use echomesh_common::wire::OuterEnvelope;
use serde_json::json;

use crate::{inbound, ApiState};

pub fn router() -> Router<Arc<ApiState>> {
    Router::new().route("/v1/messages", post(receive))
}

async fn receive(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<OuterEnvelope>, JsonRejection>,
) -> Result<Json<serde_json::Value>, CoreError> {
    let Json(envelope) = payload
        .map_err(|e| CoreError::BadRequest { message: format!("invalid envelope: {e}") })?;
    let msg_id = inbound::handle_envelope(&state, envelope).await?;
    Ok(Json(json!({ "v": 1, "ok": true, "msg_id": msg_id })))
}
