//! End-to-end note-to-self: the outbound sender posts through a real
//! loopback ingress and the inbound pipeline stores the mirrored row.

use std::sync::atomic::AtomicU16;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use echomesh_api::replay::ReplayGuard;
use echomesh_api::ApiState;
use echomesh_common::models::{Direction, MessageBlob, MessageStatus};
use echomesh_common::now_millis;
use echomesh_crypto::{DeviceKek, SealedEnvelopeCodec};
use echomesh_db::repository::messages;
use echomesh_db::Store;
use echomesh_node::vault::IdentityVault;
use echomesh_node::{OutboundSender, SendOutcome};
use echomesh_tor::TorState;

struct Node {
    store: Store,
    sender: Arc<OutboundSender>,
    self_fp: String,
    port: u16,
    _state_tx: tokio::sync::watch::Sender<TorState>,
}

async fn start_node() -> Node {
    let store = Store::open_in_memory().await.unwrap();
    let kek = Arc::new(DeviceKek::from_bytes([8u8; 32]));
    let identity = IdentityVault::new(store.clone(), Arc::clone(&kek))
        .ensure_identity()
        .await
        .unwrap();

    let (state_tx, tor_state) = tokio::sync::watch::channel(TorState::Stopped);
    let api_state = ApiState {
        store: store.clone(),
        codec: Arc::new(SealedEnvelopeCodec),
        replay: Arc::new(ReplayGuard::new()),
        kek: Arc::clone(&kek),
        tor_state,
        bound_port: Arc::new(AtomicU16::new(0)),
        strict_verified: true,
        debug: false,
    };
    let listener = echomesh_api::bind_ephemeral(&api_state).await.unwrap();
    let port = api_state.bound_port();
    let router = echomesh_api::build_router(api_state);
    tokio::spawn(async move {
        let _ = echomesh_api::serve(listener, router, std::future::pending()).await;
    });

    let sender = OutboundSender::new(store.clone(), kek, Arc::new(SealedEnvelopeCodec), false);
    sender.set_loopback_port(port);

    Node {
        store,
        sender,
        self_fp: identity.fingerprint.as_str().to_owned(),
        port,
        _state_tx: state_tx,
    }
}

fn decoded_body(blob: &str) -> String {
    let blob = MessageBlob::parse(blob).unwrap();
    let pt = B64.decode(blob.plaintext_b64.expect("inbound rows carry a plaintext slot")).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&pt).unwrap();
    json["body"].as_str().unwrap().to_owned()
}

#[tokio::test]
async fn self_exchange_round_trip() {
    let node = start_node().await;

    let outcome = node.sender.send_message(&node.self_fp, "hi").await.unwrap();
    assert_eq!(outcome, SendOutcome::Sent);

    let conv = echomesh_common::types::Fingerprint::parse(&node.self_fp).unwrap();
    let rows = messages::list_conversation(&node.store, &conv, 10).await.unwrap();
    assert_eq!(rows.len(), 2, "one Out row and one In row");

    let out_row = rows.iter().find(|m| m.direction == Direction::Out).unwrap();
    let in_row = rows.iter().find(|m| m.direction == Direction::In).unwrap();

    assert!(out_row.id.starts_with("OUT:"));
    assert_eq!(out_row.status, MessageStatus::SentOk);
    assert_eq!(out_row.conv_id, conv);

    assert_eq!(in_row.id, out_row.msg_id(), "both halves share the protocol id");
    assert_eq!(in_row.status, MessageStatus::Received);
    assert_eq!(in_row.conv_id, conv);
    assert_eq!(decoded_body(&in_row.blob), "hi");

    // outbound half stays ciphertext-only
    let out_blob = MessageBlob::parse(&out_row.blob).unwrap();
    assert!(out_blob.plaintext_b64.is_none());
}

#[tokio::test]
async fn queued_note_to_self_is_delivered_by_the_sweeper() {
    let node = start_node().await;

    // simulate the ingress not being up yet
    let parked = OutboundSender::new(
        node.store.clone(),
        Arc::new(DeviceKek::from_bytes([8u8; 32])),
        Arc::new(SealedEnvelopeCodec),
        false,
    );
    let outcome = parked.send_message(&node.self_fp, "later").await.unwrap();
    assert_eq!(outcome, SendOutcome::QueuedLocalNotReady);

    let conv = echomesh_common::types::Fingerprint::parse(&node.self_fp).unwrap();
    let rows = messages::list_conversation(&node.store, &conv, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, MessageStatus::Queued);

    // the ingress comes up; the sweeper re-drives the queued row
    parked.set_loopback_port(node.port);
    let swept = parked.sweep_retries(now_millis() + 60 * 60 * 1000).await.unwrap();
    assert_eq!(swept, 1);

    let rows = messages::list_conversation(&node.store, &conv, 10).await.unwrap();
    let out_row = rows.iter().find(|m| m.direction == Direction::Out).unwrap();
    assert_eq!(out_row.status, MessageStatus::SentOk);
    assert!(rows.iter().any(|m| m.direction == Direction::In));
}
