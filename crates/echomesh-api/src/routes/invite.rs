//! One-shot invite acceptance.
//!
//! The ordering here is deliberate: cheap state checks first, then the
//! atomic conditional consumption. Two racing redeemers both pass the read
//! checks, but only the first conditional update wins; the loser sees 409.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::get;
use axum::{Json, Router};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use echomesh_common::error::CoreError;
use echomesh_common::now_millis;
use echomesh_common::validation::validate_token;
use echomesh_common::wire::InviteAccept;
use echomesh_db::repository::{identities, invites};

use crate::ApiState;

pub fn router() -> Router<Arc<ApiState>> {
    Router::new().route("/invite/{token}", get(accept))
}

async fn accept(
    State(state): State<Arc<ApiState>>,
    Path(token): Path<String>,
) -> Result<Json<InviteAccept>, CoreError> {
    // A token that cannot exist is indistinguishable from one that doesn't.
    validate_token(&token).map_err(|_| CoreError::InviteNotFound)?;

    let identity = identities::find_active(&state.store)
        .await
        .map_err(internal)?
        .ok_or(CoreError::NoIdentity)?;
    let onion = identity.onion.as_ref().ok_or(CoreError::NoOnion)?;

    let now = now_millis();
    let invite = invites::find(&state.store, &token)
        .await
        .map_err(internal)?
        .ok_or(CoreError::InviteNotFound)?;
    if invite.is_used() {
        return Err(CoreError::InviteUsed);
    }
    if invite.is_expired(now) {
        return Err(CoreError::InviteExpired);
    }

    // Only the first caller flips used_at.
    if !invites::mark_used_if_valid(&state.store, &token, now).await.map_err(internal)? {
        return Err(CoreError::InviteUsed);
    }
    tracing::info!("invite redeemed");

    Ok(Json(InviteAccept::new(
        identity.fingerprint.as_str(),
        onion.as_str(),
        &B64.encode(&identity.public_ring),
        now,
    )))
}

fn internal(e: echomesh_db::StoreError) -> CoreError {
    CoreError::Internal(anyhow::Error::from(e))
}
