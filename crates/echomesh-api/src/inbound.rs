//! The inbound envelope pipeline.
//!
//! Checks run strictly in order; each step either passes the envelope on or
//! rejects with a stable code. The allowlist and replay checks come before
//! any decryption, so unknown or replaying senders cost no crypto.
//!
//! ```text
//! shape -> recipient-is-self -> allowlist/trust -> replay -> decrypt+verify
//!       -> inner structure -> type dispatch (msg | addr_update)
//! ```

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use echomesh_common::error::CoreError;
use echomesh_common::models::{Direction, Identity, Message, MessageBlob, MessageStatus};
use echomesh_common::types::{Fingerprint, OnionAddr};
use echomesh_common::validation::{
    validate_created_at, validate_msg_id, validate_nonce, MAX_BODY_CHARS,
};
use echomesh_common::wire::{InnerPayload, OuterEnvelope, PlaintextBody, TYPE_ADDR_UPDATE, TYPE_MSG};
use echomesh_common::now_millis;
use echomesh_crypto::envelope::CodecError;
use echomesh_crypto::{Keyring, PublicRing};
use echomesh_db::repository::{contacts, identities, messages};

use crate::ApiState;

/// Sealed payload cap after whitespace stripping: 2x the request body cap.
const MAX_PAYLOAD_B64_LEN: usize = 2 * 64 * 1024;

/// Run the full pipeline for one parsed envelope. Returns the accepted
/// protocol msg id.
pub async fn handle_envelope(
    state: &ApiState,
    envelope: OuterEnvelope,
) -> Result<String, CoreError> {
    let now = now_millis();

    // 1. Envelope shape
    if envelope.v != 1 {
        return Err(CoreError::UnsupportedVersion);
    }
    validate_msg_id(&envelope.msg_id)?;
    validate_nonce(&envelope.nonce)?;
    validate_created_at(envelope.created_at, now)?;
    let sender_fp = Fingerprint::parse(&envelope.sender_fp)
        .map_err(|_| CoreError::BadRequest { message: "invalid sender_fp".into() })?;
    let recipient_fp = Fingerprint::parse(&envelope.recipient_fp)
        .map_err(|_| CoreError::BadRequest { message: "invalid recipient_fp".into() })?;

    let payload_b64: String =
        envelope.payload_pgp.chars().filter(|c| !c.is_whitespace()).collect();
    if payload_b64.len() > MAX_PAYLOAD_B64_LEN {
        return Err(CoreError::PayloadTooLarge);
    }

    // 2. Recipient must be this device
    let identity = identities::find_active(&state.store)
        .await
        .map_err(internal)?
        .ok_or(CoreError::LocalIdentityMissing)?;
    if recipient_fp != identity.fingerprint {
        return Err(CoreError::RecipientNotSelf);
    }

    let is_self_sender = sender_fp == identity.fingerprint;

    // Debug-plaintext path: build-flag gated and self-to-self only.
    if payload_b64.is_empty() {
        return match (state.debug, is_self_sender, envelope.debug_plaintext.as_deref()) {
            (true, true, Some(body)) => {
                handle_debug_plaintext(state, &envelope, &sender_fp, body, now).await
            }
            _ => Err(CoreError::BadRequest { message: "empty payload".into() }),
        };
    }

    // 3. Allowlist + trust. A device is implicitly allowed to message itself.
    let sender_ring_bytes = if is_self_sender {
        identity.public_ring.clone()
    } else {
        let contact = contacts::find(&state.store, &sender_fp)
            .await
            .map_err(internal)?
            .ok_or(CoreError::SenderNotAllowed)?;
        if state.strict_verified && !contact.is_verified() {
            return Err(CoreError::SenderNotVerified);
        }
        contact.public_ring
    };

    // 4. Replay — atomic check-and-insert, before any crypto
    if !state.replay.check_and_insert(sender_fp.as_str(), &envelope.nonce) {
        return Err(CoreError::ReplayDetected);
    }

    // 5. Decrypt + verify
    let sealed = B64
        .decode(&payload_b64)
        .map_err(|_| CoreError::CryptoDecryptFail)?;
    let sender_ring =
        PublicRing::from_bytes(&sender_ring_bytes).map_err(|_| CoreError::CryptoDecryptFail)?;
    let keyring = open_keyring(state, &identity)?;
    let plaintext = state
        .codec
        .decrypt_and_verify(&sealed, &sender_ring, &keyring)
        .map_err(|e| match e {
            CodecError::BadSignature => CoreError::SenderUnknown,
            CodecError::NoMatchingRecipient => CoreError::RecipientUnknown,
            _ => CoreError::CryptoDecryptFail,
        })?;

    // 6. Inner structure
    let inner: InnerPayload =
        serde_json::from_slice(&plaintext).map_err(|_| CoreError::PlaintextJsonInvalid)?;
    if inner.v != 1 {
        return Err(CoreError::UnsupportedVersion);
    }
    if inner.msg_id != envelope.msg_id {
        return Err(CoreError::MsgIdMismatch);
    }
    let inner_conv = Fingerprint::parse(&inner.conv_id).map_err(|_| CoreError::ConvIdMismatch)?;
    if inner_conv != sender_fp {
        return Err(CoreError::ConvIdMismatch);
    }

    // 7. Type dispatch
    match envelope.kind.as_str() {
        TYPE_MSG => {
            handle_message(state, &envelope, &sender_fp, &recipient_fp, &inner, &payload_b64, now)
                .await
        }
        TYPE_ADDR_UPDATE => handle_addr_update(state, &envelope, &sender_fp, &inner).await,
        _ => Err(CoreError::InvalidType),
    }
}

async fn handle_message(
    state: &ApiState,
    envelope: &OuterEnvelope,
    sender_fp: &Fingerprint,
    recipient_fp: &Fingerprint,
    inner: &InnerPayload,
    payload_b64: &str,
    now: i64,
) -> Result<String, CoreError> {
    let body = inner
        .body
        .as_deref()
        .ok_or(CoreError::BadRequest { message: "missing body".into() })?;
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(CoreError::BodyTooLarge);
    }

    // Best-effort onion refresh from the hint; never blocks acceptance.
    if let Some(hint) = inner.sender_onion.as_deref() {
        if let Ok(onion) = OnionAddr::parse(hint) {
            if let Err(e) = contacts::apply_inbound_onion_update(&state.store, sender_fp, &onion).await
            {
                tracing::debug!("sender onion hint not applied: {e}");
            }
        }
    }

    let plaintext_json = serde_json::to_vec(&PlaintextBody { body: body.to_owned() })
        .map_err(|e| CoreError::Internal(e.into()))?;
    let blob = MessageBlob::inbound(payload_b64.to_owned(), B64.encode(plaintext_json));

    let message = Message {
        id: Message::db_id(Direction::In, &envelope.msg_id),
        conv_id: sender_fp.clone(),
        direction: Direction::In,
        sender_fp: sender_fp.clone(),
        recipient_fp: recipient_fp.clone(),
        created_at: envelope.created_at,
        server_received_at: now,
        status: MessageStatus::Received,
        attempts: 0,
        last_error: None,
        next_retry_at: 0,
        kind: TYPE_MSG.to_owned(),
        blob: blob.encode(),
    };
    let inserted = messages::insert(&state.store, &message).await.map_err(internal)?;
    if !inserted {
        tracing::debug!(msg_id = %envelope.msg_id, "duplicate message row ignored");
    }
    Ok(envelope.msg_id.clone())
}

async fn handle_addr_update(
    state: &ApiState,
    envelope: &OuterEnvelope,
    sender_fp: &Fingerprint,
    inner: &InnerPayload,
) -> Result<String, CoreError> {
    let new_onion = inner
        .new_onion
        .as_deref()
        .ok_or(CoreError::BadRequest { message: "missing new_onion".into() })?;
    let onion = OnionAddr::parse(new_onion)?;
    contacts::apply_inbound_onion_update(&state.store, sender_fp, &onion)
        .await
        .map_err(internal)?;
    // Address rotations are control traffic; nothing is stored as chat.
    Ok(envelope.msg_id.clone())
}

async fn handle_debug_plaintext(
    state: &ApiState,
    envelope: &OuterEnvelope,
    sender_fp: &Fingerprint,
    body: &str,
    now: i64,
) -> Result<String, CoreError> {
    if envelope.kind != TYPE_MSG {
        return Err(CoreError::InvalidType);
    }
    if body.chars().count() > MAX_BODY_CHARS {
        return Err(CoreError::BodyTooLarge);
    }
    if !state.replay.check_and_insert(sender_fp.as_str(), &envelope.nonce) {
        return Err(CoreError::ReplayDetected);
    }

    let plaintext_json = serde_json::to_vec(&PlaintextBody { body: body.to_owned() })
        .map_err(|e| CoreError::Internal(e.into()))?;
    let blob = MessageBlob::inbound(String::new(), B64.encode(plaintext_json));
    let message = Message {
        id: Message::db_id(Direction::In, &envelope.msg_id),
        conv_id: sender_fp.clone(),
        direction: Direction::In,
        sender_fp: sender_fp.clone(),
        recipient_fp: sender_fp.clone(),
        created_at: envelope.created_at,
        server_received_at: now,
        status: MessageStatus::Received,
        attempts: 0,
        last_error: None,
        next_retry_at: 0,
        kind: TYPE_MSG.to_owned(),
        blob: blob.encode(),
    };
    messages::insert(&state.store, &message).await.map_err(internal)?;
    Ok(envelope.msg_id.clone())
}

fn open_keyring(state: &ApiState, identity: &Identity) -> Result<Keyring, CoreError> {
    let sealed = std::str::from_utf8(&identity.sealed_secret_ring)
        .map_err(|_| CoreError::CryptoDecryptFail)?;
    Keyring::unseal(&state.kek, sealed).map_err(|_| CoreError::CryptoDecryptFail)
}

fn internal(e: echomesh_db::StoreError) -> CoreError {
    CoreError::Internal(anyhow::Error::from(e))
}
