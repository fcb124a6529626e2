//! Health endpoint: 200 only when the transport is fully `Ready`.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;

use crate::ApiState;

#[derive(Serialize)]
struct HealthResponse {
    v: u8,
    ok: bool,
    state: &'static str,
    port: u16,
}

pub fn router() -> Router<Arc<ApiState>> {
    Router::new().route("/v1/health", get(health))
}

async fn health(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let tor_state = state.tor_state.borrow().clone();
    let ok = tor_state.is_ready();
    let body = HealthResponse {
        v: 1,
        ok,
        state: tor_state.tag(),
        port: state.bound_port(),
    };
    let status = if ok { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };
    (status, Json(body))
}
