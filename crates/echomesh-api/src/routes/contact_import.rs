//! Direct contact import endpoint.
//!
//! One of the four import entry points; like the others it funnels into
//! `ContactDraft::validate` and the merge-safe upsert, so the trust rules
//! are identical regardless of how a contact arrives.

use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use echomesh_common::error::CoreError;
use echomesh_common::models::{ContactDraft, UpsertOutcome};
use echomesh_common::now_millis;
use echomesh_db::repository::{contacts, identities};
use serde::Deserialize;
use serde_json::json;

use crate::ApiState;

#[derive(Debug, Deserialize)]
struct ImportRequest {
    #[serde(default)]
    v: Option<u8>,
    fingerprint: String,
    #[serde(default)]
    onion: Option<String>,
    pub_b64: String,
    #[serde(default)]
    display_name: Option<String>,
}

pub fn router() -> Router<Arc<ApiState>> {
    Router::new().route("/v1/contact_import", post(import))
}

async fn import(
    State(state): State<Arc<ApiState>>,
    payload: Result<Json<ImportRequest>, JsonRejection>,
) -> Result<Json<serde_json::Value>, CoreError> {
    let Json(req) = payload
        .map_err(|e| CoreError::BadRequest { message: format!("invalid import: {e}") })?;
    if req.v.unwrap_or(1) != 1 {
        return Err(CoreError::UnsupportedVersion);
    }

    let public_ring = B64
        .decode(req.pub_b64.trim())
        .map_err(|_| CoreError::BadRequest { message: "pub_b64 is not base64".into() })?;

    let self_fp = identities::find_active(&state.store)
        .await
        .map_err(internal)?
        .map(|i| i.fingerprint);

    let draft = ContactDraft::validate(
        &req.fingerprint,
        req.onion.as_deref(),
        public_ring,
        None,
        self_fp.as_ref(),
    )?;

    let outcome = contacts::upsert_merge_safe(&state.store, &draft, now_millis())
        .await
        .map_err(internal)?;
    if let Some(name) = req.display_name.as_deref() {
        contacts::set_display_name(&state.store, &draft.fingerprint, Some(name))
            .await
            .map_err(internal)?;
    }

    Ok(Json(json!({
        "v": 1,
        "ok": true,
        "fingerprint": draft.fingerprint.as_str(),
        "outcome": outcome_tag(&outcome),
    })))
}

fn outcome_tag(outcome: &UpsertOutcome) -> &'static str {
    match outcome {
        UpsertOutcome::Inserted => "inserted",
        UpsertOutcome::NoChange => "no_change",
        UpsertOutcome::UpdatedUnverified => "updated_unverified",
        UpsertOutcome::PendingApproval { .. } => "pending_approval",
    }
}

fn internal(e: echomesh_db::StoreError) -> CoreError {
    CoreError::Internal(anyhow::Error::from(e))
}
