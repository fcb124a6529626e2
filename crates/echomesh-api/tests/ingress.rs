//! Ingress pipeline tests: the router is exercised in-process with real
//! crypto and an in-memory store.

use std::sync::atomic::AtomicU16;
use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use echomesh_api::replay::ReplayGuard;
use echomesh_api::{build_router, ApiState};
use echomesh_common::models::invite::INVITE_TTL_MS;
use echomesh_common::models::{ContactDraft, Invite};
use echomesh_common::now_millis;
use echomesh_common::types::{Fingerprint, OnionAddr};
use echomesh_common::wire::{InnerPayload, OuterEnvelope, TYPE_MSG};
use echomesh_crypto::{DeviceKek, EnvelopeCodec, Keyring, SealedEnvelopeCodec};
use echomesh_db::repository::{contacts, identities, invites, messages};
use echomesh_db::Store;
use echomesh_tor::TorState;
use http_body_util::BodyExt;
use tower::ServiceExt;

struct Harness {
    state: ApiState,
    device: Keyring,
    device_fp: Fingerprint,
}

async fn harness(ready: bool) -> Harness {
    let store = Store::open_in_memory().await.unwrap();
    let kek = Arc::new(DeviceKek::from_bytes([7u8; 32]));

    let device = Keyring::generate();
    let sealed_ring = kek.seal(&device.secret_bytes()).unwrap();
    let device_fp = Fingerprint::parse(&device.fingerprint()).unwrap();
    let onion = OnionAddr::parse(&format!("{}.onion", "a".repeat(56))).unwrap();
    identities::insert(
        &store,
        &echomesh_common::models::Identity {
            fingerprint: device_fp.clone(),
            onion: Some(onion.clone()),
            public_ring: device.public_ring().to_bytes(),
            sealed_secret_ring: sealed_ring.into_bytes(),
            active: true,
            created_at: now_millis(),
        },
    )
    .await
    .unwrap();

    let tor_state = if ready {
        TorState::Ready {
            onion: onion.as_str().to_owned(),
            socks_host: "127.0.0.1".into(),
            socks_port: 9050,
        }
    } else {
        TorState::Stopped
    };
    let (_tx, rx) = {
        let (tx, rx) = tokio::sync::watch::channel(tor_state);
        // keep the sender alive for the duration of the test
        (Box::leak(Box::new(tx)), rx)
    };

    let state = ApiState {
        store,
        codec: Arc::new(SealedEnvelopeCodec),
        replay: Arc::new(ReplayGuard::new()),
        kek,
        tor_state: rx,
        bound_port: Arc::new(AtomicU16::new(0)),
        strict_verified: true,
        debug: false,
    };
    Harness { state, device, device_fp }
}

async fn add_verified_contact(h: &Harness, peer: &Keyring) -> Fingerprint {
    let draft = ContactDraft::validate(
        &peer.fingerprint(),
        None,
        peer.public_ring().to_bytes(),
        None,
        None,
    )
    .unwrap();
    contacts::upsert_merge_safe(&h.state.store, &draft, now_millis()).await.unwrap();
    contacts::mark_verified(&h.state.store, &draft.fingerprint).await.unwrap();
    draft.fingerprint
}

fn sealed_envelope(h: &Harness, sender: &Keyring, msg_id: &str, nonce: &str, body: &str) -> OuterEnvelope {
    let sender_fp = sender.fingerprint();
    let inner = InnerPayload::message(msg_id, &sender_fp, body, None);
    let plaintext = serde_json::to_vec(&inner).unwrap();
    let sealed = SealedEnvelopeCodec
        .encrypt_and_sign(
            &plaintext,
            &[&h.device.public_ring(), &sender.public_ring()],
            sender,
        )
        .unwrap();
    OuterEnvelope {
        v: 1,
        kind: TYPE_MSG.into(),
        msg_id: msg_id.into(),
        sender_fp,
        recipient_fp: h.device_fp.as_str().to_owned(),
        created_at: now_millis(),
        nonce: nonce.into(),
        payload_pgp: B64.encode(sealed),
        debug_plaintext: None,
    }
}

async fn post_envelope(h: &Harness, envelope: &OuterEnvelope) -> (StatusCode, serde_json::Value) {
    let router = build_router(h.state.clone());
    let request = Request::post("/v1/messages")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(envelope).unwrap()))
        .unwrap();
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    (status, json)
}

#[tokio::test]
async fn unknown_sender_is_rejected_and_nothing_persists() {
    let h = harness(true).await;
    let stranger = Keyring::generate();
    let envelope = sealed_envelope(&h, &stranger, "m-1", "nonce-1", "hi");

    let (status, json) = post_envelope(&h, &envelope).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "SENDER_NOT_ALLOWED");
    assert!(messages::find(&h.state.store, "m-1").await.unwrap().is_none());
}

#[tokio::test]
async fn unverified_sender_is_rejected_in_strict_mode() {
    let h = harness(true).await;
    let peer = Keyring::generate();
    let draft = ContactDraft::validate(
        &peer.fingerprint(),
        None,
        peer.public_ring().to_bytes(),
        None,
        None,
    )
    .unwrap();
    contacts::upsert_merge_safe(&h.state.store, &draft, now_millis()).await.unwrap();

    let envelope = sealed_envelope(&h, &peer, "m-1", "nonce-1", "hi");
    let (status, json) = post_envelope(&h, &envelope).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(json["code"], "SENDER_NOT_VERIFIED");
}

#[tokio::test]
async fn verified_sender_message_is_stored_with_plaintext_slot() {
    let h = harness(true).await;
    let peer = Keyring::generate();
    let peer_fp = add_verified_contact(&h, &peer).await;

    let envelope = sealed_envelope(&h, &peer, "m-1", "nonce-1", "hello there");
    let (status, json) = post_envelope(&h, &envelope).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["msg_id"], "m-1");

    let stored = messages::find(&h.state.store, "m-1").await.unwrap().unwrap();
    assert_eq!(stored.conv_id, peer_fp);
    let blob = echomesh_common::models::MessageBlob::parse(&stored.blob).unwrap();
    let pt = B64.decode(blob.plaintext_b64.unwrap()).unwrap();
    let body: serde_json::Value = serde_json::from_slice(&pt).unwrap();
    assert_eq!(body["body"], "hello there");
}

#[tokio::test]
async fn replayed_envelope_is_rejected_with_one_row() {
    let h = harness(true).await;
    let peer = Keyring::generate();
    let peer_fp = add_verified_contact(&h, &peer).await;

    let envelope = sealed_envelope(&h, &peer, "m-1", "nonce-1", "hi");
    let (first, _) = post_envelope(&h, &envelope).await;
    assert_eq!(first, StatusCode::OK);

    let (second, json) = post_envelope(&h, &envelope).await;
    assert_eq!(second, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(json["code"], "REPLAY_DETECTED");

    let listed = messages::list_conversation(&h.state.store, &peer_fp, 50).await.unwrap();
    assert_eq!(listed.len(), 1);
}

#[tokio::test]
async fn wrong_recipient_is_unauthorized() {
    let h = harness(true).await;
    let peer = Keyring::generate();
    add_verified_contact(&h, &peer).await;

    let mut envelope = sealed_envelope(&h, &peer, "m-1", "nonce-1", "hi");
    envelope.recipient_fp = "9".repeat(40);
    let (status, json) = post_envelope(&h, &envelope).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(json["code"], "RECIPIENT_NOT_SELF");
}

#[tokio::test]
async fn oversized_body_is_rejected() {
    let h = harness(true).await;
    let peer = Keyring::generate();
    add_verified_contact(&h, &peer).await;

    let fine = sealed_envelope(&h, &peer, "m-ok", "nonce-1", &"x".repeat(500));
    let (status, _) = post_envelope(&h, &fine).await;
    assert_eq!(status, StatusCode::OK);

    let too_big = sealed_envelope(&h, &peer, "m-big", "nonce-2", &"x".repeat(501));
    let (status, json) = post_envelope(&h, &too_big).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BODY_TOO_LARGE");
}

#[tokio::test]
async fn future_created_at_is_rejected_past_the_skew() {
    let h = harness(true).await;
    let peer = Keyring::generate();
    add_verified_contact(&h, &peer).await;

    let mut envelope = sealed_envelope(&h, &peer, "m-1", "nonce-1", "hi");
    envelope.created_at = now_millis() + 6 * 60 * 1000;
    let (status, json) = post_envelope(&h, &envelope).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "BAD_REQUEST");
}

#[tokio::test]
async fn msg_id_mismatch_is_rejected() {
    let h = harness(true).await;
    let peer = Keyring::generate();
    add_verified_contact(&h, &peer).await;

    let mut envelope = sealed_envelope(&h, &peer, "m-1", "nonce-1", "hi");
    // outer id diverges from the sealed inner id
    envelope.msg_id = "m-other".into();
    let (status, json) = post_envelope(&h, &envelope).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(json["code"], "MSG_ID_MISMATCH");
}

#[tokio::test]
async fn health_reflects_transport_state() {
    let ready = harness(true).await;
    let router = build_router(ready.state.clone());
    let response = router
        .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let stopped = harness(false).await;
    let router = build_router(stopped.state.clone());
    let response = router
        .oneshot(Request::get("/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn unknown_route_is_hard_404() {
    let h = harness(true).await;
    let router = build_router(h.state.clone());
    let response = router
        .oneshot(Request::get("/v1/debug/state").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invite_acceptance_is_at_most_once() {
    let h = harness(true).await;
    let token = "T".repeat(32);
    let now = now_millis();
    invites::insert(
        &h.state.store,
        &Invite {
            token: token.clone(),
            created_at: now,
            expires_at: now + INVITE_TTL_MS,
            used_at: None,
            consumer_hint: None,
        },
    )
    .await
    .unwrap();

    let router = build_router(h.state.clone());
    let response = router
        .clone()
        .oneshot(Request::get(format!("/invite/{token}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["v"], 2);
    assert_eq!(json["type"], "invite_accept");
    assert_eq!(json["fingerprint"], h.device_fp.as_str());

    let response = router
        .clone()
        .oneshot(Request::get(format!("/invite/{token}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let response = router
        .oneshot(Request::get(format!("/invite/{}", "U".repeat(32))).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn expired_invite_is_gone() {
    let h = harness(true).await;
    let token = "T".repeat(32);
    let now = now_millis();
    invites::insert(
        &h.state.store,
        &Invite {
            token: token.clone(),
            created_at: now - INVITE_TTL_MS - 1,
            expires_at: now - 1,
            used_at: None,
            consumer_hint: None,
        },
    )
    .await
    .unwrap();

    let router = build_router(h.state.clone());
    let response = router
        .oneshot(Request::get(format!("/invite/{token}")).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::GONE);
}

#[tokio::test]
async fn contact_import_converges_on_the_same_rules() {
    let h = harness(true).await;
    let peer = Keyring::generate();
    let body = serde_json::json!({
        "v": 1,
        "fingerprint": peer.fingerprint(),
        "pub_b64": B64.encode(peer.public_ring().to_bytes()),
        "display_name": "Peer",
    });

    let router = build_router(h.state.clone());
    let response = router
        .clone()
        .oneshot(
            Request::post("/v1/contact_import")
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // importing this device's own identity is rejected
    let own = serde_json::json!({
        "v": 1,
        "fingerprint": h.device_fp.as_str(),
        "pub_b64": B64.encode(h.device.public_ring().to_bytes()),
    });
    let response = router
        .oneshot(
            Request::post("/v1/contact_import")
                .header("content-type", "application/json")
                .body(Body::from(own.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
}
