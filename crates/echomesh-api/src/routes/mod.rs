//! Ingress routes. Every response body carries the `{"v":1,"ok":...}`
//! envelope; errors add a stable `code`.

pub mod contact_import;
pub mod debug;
pub mod health;
pub mod invite;
pub mod messages;

use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

/// Hard 404 for anything outside the route table.
pub async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "v": 1, "ok": false, "code": "NOT_FOUND" })),
    )
}
