//! Debug-only probes. Mounted exclusively when the debug flag is active;
//! release configurations never see these paths.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use echomesh_common::error::CoreError;
use echomesh_db::repository::identities;
use serde_json::json;

use crate::ApiState;

pub fn router() -> Router<Arc<ApiState>> {
    Router::new()
        .route("/v1/debug/state", get(state_probe))
        .route("/v1/debug/identity", get(identity_probe))
}

async fn state_probe(State(state): State<Arc<ApiState>>) -> Json<serde_json::Value> {
    let tor_state = state.tor_state.borrow().clone();
    Json(json!({
        "v": 1,
        "ok": true,
        "state": tor_state.tag(),
        "onion": tor_state.onion(),
        "port": state.bound_port(),
    }))
}

async fn identity_probe(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<serde_json::Value>, CoreError> {
    let identity = identities::find_active(&state.store)
        .await
        .map_err(|e| CoreError::Internal(anyhow::Error::from(e)))?
        .ok_or(CoreError::LocalIdentityMissing)?;
    Ok(Json(json!({
        "v": 1,
        "ok": true,
        "fingerprint": identity.fingerprint.as_str(),
        "onion": identity.onion.as_ref().map(|o| o.as_str()),
    })))
}
