//! The outbound pipeline.
//!
//! Builds and seals envelopes, persists them as `Queued` *before* any
//! network I/O, resolves the transport from the pinned contact address, and
//! records the delivery result. Note-to-self traffic short-circuits through
//! the loopback ingress; everything else goes through the SOCKS-attached
//! HTTP client over Tor.

use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use base64::engine::general_purpose::{STANDARD as B64, URL_SAFE_NO_PAD};
use base64::Engine as _;
use echomesh_common::error::CoreError;
use echomesh_common::models::{Contact, Direction, Message, MessageBlob, MessageStatus};
use echomesh_common::now_millis;
use echomesh_common::types::{Fingerprint, OnionAddr};
use echomesh_common::wire::{InnerPayload, OuterEnvelope, TYPE_ADDR_UPDATE, TYPE_MSG};
use echomesh_crypto::{DeviceKek, EnvelopeCodec, Keyring, PublicRing};
use echomesh_db::repository::{contacts, identities, messages};
use echomesh_db::Store;

/// Sealed payload cap after base64 encoding and whitespace stripping.
const MAX_PAYLOAD_B64_LEN: usize = 2 * 64 * 1024;
/// Nonce entropy (bytes) before URL-safe base64.
const NONCE_LEN: usize = 18;
/// Base retry delay; doubles per attempt up to the cap.
const RETRY_BASE_MS: i64 = 15_000;
const RETRY_CAP_MS: i64 = 15 * 60 * 1000;

/// Outcome of one send attempt.
///
/// `Queued*` outcomes leave the row retryable; `Failed*` outcomes are
/// terminal and the row is marked `Failed` before this value is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    QueuedLocalNotReady,
    QueuedTorNotReady,
    QueuedHttpFail(u16),
    FailedMissingAddress,
    FailedBadAddress,
    FailedBlockedDirectHttp,
    FailedCryptoError,
    FailedContactNotVerified,
}

impl SendOutcome {
    /// Stable code recorded in the row's `last_error` column.
    pub fn code(&self) -> String {
        match self {
            Self::Sent => "SENT_OK".into(),
            Self::QueuedLocalNotReady => "QUEUED_LOCAL_NOT_READY".into(),
            Self::QueuedTorNotReady => "QUEUED_TOR_NOT_READY".into(),
            Self::QueuedHttpFail(code) => format!("QUEUED_HTTP_FAIL_{code}"),
            Self::FailedMissingAddress => "FAILED_MISSING_ADDRESS".into(),
            Self::FailedBadAddress => "FAILED_BAD_ADDRESS".into(),
            Self::FailedBlockedDirectHttp => "FAILED_BLOCKED_DIRECT_HTTP".into(),
            Self::FailedCryptoError => "FAILED_CRYPTO_ERROR".into(),
            Self::FailedContactNotVerified => "FAILED_CONTACT_NOT_VERIFIED".into(),
        }
    }
}

/// Where a pinned peer address routes.
#[derive(Debug, PartialEq, Eq)]
enum AddressKind {
    Onion(OnionAddr),
    /// A non-onion host. Only debug configurations may talk to one.
    Direct(String),
    Bad,
}

/// Classify a raw peer address. Anything carrying URL structure (path,
/// query, fragment, userinfo) is ambiguous and rejected outright.
fn classify_address(raw: &str) -> AddressKind {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return AddressKind::Bad;
    }
    if trimmed.contains(['/', '?', '#', '@']) || trimmed.contains("://") {
        return AddressKind::Bad;
    }
    if let Ok(onion) = OnionAddr::parse(trimmed) {
        return AddressKind::Onion(onion);
    }
    let (host, port) = match trimmed.rsplit_once(':') {
        Some((h, p)) => (h, Some(p)),
        None => (trimmed, None),
    };
    if let Some(port) = port {
        if port.parse::<u16>().map(|p| p == 0).unwrap_or(true) {
            return AddressKind::Bad;
        }
    }
    let host_ok = !host.is_empty()
        && host
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-');
    if host_ok {
        AddressKind::Direct(trimmed.to_owned())
    } else {
        AddressKind::Bad
    }
}

pub struct OutboundSender {
    store: Store,
    kek: Arc<DeviceKek>,
    codec: Arc<dyn EnvelopeCodec>,
    /// SOCKS-aware client, attached once the transport is ready.
    socks: RwLock<Option<reqwest::Client>>,
    /// Plain client for loopback note-to-self delivery.
    loopback: reqwest::Client,
    /// Ingress port; 0 until the local server is up.
    loopback_port: AtomicU16,
    /// Allow non-onion peer hosts (debug configurations only).
    allow_direct_http: bool,
}

impl OutboundSender {
    pub fn new(
        store: Store,
        kek: Arc<DeviceKek>,
        codec: Arc<dyn EnvelopeCodec>,
        allow_direct_http: bool,
    ) -> Arc<Self> {
        let loopback = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .expect("failed to build loopback client");
        Arc::new(Self {
            store,
            kek,
            codec,
            socks: RwLock::new(None),
            loopback,
            loopback_port: AtomicU16::new(0),
            allow_direct_http,
        })
    }

    /// Attach a SOCKS5h-proxied client pointed at the Tor endpoint.
    pub fn attach_socks_client(&self, host: &str, port: u16) -> Result<(), CoreError> {
        let proxy = reqwest::Proxy::all(format!("socks5h://{host}:{port}"))
            .map_err(|e| CoreError::Internal(e.into()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CoreError::Internal(e.into()))?;
        *self.socks.write().expect("socks lock") = Some(client);
        tracing::info!("socks client attached");
        Ok(())
    }

    /// Drop the SOCKS client; subsequent onion sends queue as not-ready.
    pub fn detach_socks_client(&self) {
        *self.socks.write().expect("socks lock") = None;
    }

    pub fn set_loopback_port(&self, port: u16) {
        self.loopback_port.store(port, Ordering::Relaxed);
    }

    /// Send a chat message to `to` (or to this device itself).
    pub async fn send_message(&self, to: &str, body: &str) -> Result<SendOutcome, CoreError> {
        let (identity, keyring) = self.identity_and_keyring().await?;
        let to_fp = Fingerprint::parse(to)?;

        if to_fp == identity.fingerprint {
            return self.send_to_self(&identity, &keyring, body).await;
        }

        let Some(contact) = contacts::find(&self.store, &to_fp).await.map_err(internal)? else {
            return Ok(SendOutcome::FailedMissingAddress);
        };
        if !contact.is_verified() {
            return Ok(SendOutcome::FailedContactNotVerified);
        }

        let msg_id = uuid::Uuid::new_v4().to_string();
        let nonce = fresh_nonce();
        let created_at = now_millis();
        let sender_onion = identity.onion.as_ref().map(|o| o.as_str().to_owned());
        let inner = InnerPayload::message(
            &msg_id,
            identity.fingerprint.as_str(),
            body,
            sender_onion.as_deref(),
        );

        let contact_ring =
            PublicRing::from_bytes(&contact.public_ring).map_err(|_| CoreError::EncryptFail);
        let payload_b64 = match contact_ring.and_then(|ring| {
            self.seal(&inner, &[&ring, &keyring.public_ring()], &keyring)
        }) {
            Ok(p) => p,
            Err(_) => return Ok(SendOutcome::FailedCryptoError),
        };

        let row_id = self
            .persist_queued(&identity, &to_fp, &msg_id, created_at, TYPE_MSG, &payload_b64)
            .await?;
        let envelope = outer(
            TYPE_MSG,
            &msg_id,
            &identity.fingerprint,
            &to_fp,
            created_at,
            &nonce,
            &payload_b64,
        );
        self.deliver(&row_id, 0, contact.onion.as_ref(), &envelope).await
    }

    /// Announce an onion rotation to `to`.
    pub async fn send_addr_update(&self, to: &str, new_onion: &str) -> Result<SendOutcome, CoreError> {
        let (identity, keyring) = self.identity_and_keyring().await?;
        let to_fp = Fingerprint::parse(to)?;
        let new_onion = OnionAddr::parse(new_onion)?;
        if to_fp == identity.fingerprint {
            return Err(CoreError::BadRequest { message: "cannot announce to self".into() });
        }

        let Some(contact) = contacts::find(&self.store, &to_fp).await.map_err(internal)? else {
            return Ok(SendOutcome::FailedMissingAddress);
        };
        if !contact.is_verified() {
            return Ok(SendOutcome::FailedContactNotVerified);
        }

        let msg_id = uuid::Uuid::new_v4().to_string();
        let nonce = fresh_nonce();
        let created_at = now_millis();
        let inner = InnerPayload::addr_update(
            &msg_id,
            identity.fingerprint.as_str(),
            to_fp.as_str(),
            created_at / 1000,
            &nonce,
            new_onion.as_str(),
            None,
        );

        let contact_ring =
            PublicRing::from_bytes(&contact.public_ring).map_err(|_| CoreError::EncryptFail);
        let payload_b64 = match contact_ring.and_then(|ring| {
            self.seal(&inner, &[&ring, &keyring.public_ring()], &keyring)
        }) {
            Ok(p) => p,
            Err(_) => return Ok(SendOutcome::FailedCryptoError),
        };

        let row_id = self
            .persist_queued(&identity, &to_fp, &msg_id, created_at, TYPE_ADDR_UPDATE, &payload_b64)
            .await?;
        let envelope = outer(
            TYPE_ADDR_UPDATE,
            &msg_id,
            &identity.fingerprint,
            &to_fp,
            created_at,
            &nonce,
            &payload_b64,
        );
        self.deliver(&row_id, 0, contact.onion.as_ref(), &envelope).await
    }

    /// Re-drive queued outbound rows whose retry time has come.
    pub async fn sweep_retries(&self, now: i64) -> Result<usize, CoreError> {
        let due = messages::due_retries(&self.store, now, 50).await.map_err(internal)?;
        let count = due.len();
        for row in due {
            if let Err(e) = self.retry_row(&row).await {
                tracing::warn!(row = %row.id, "retry failed: {e}");
            }
        }
        Ok(count)
    }

    async fn retry_row(&self, row: &Message) -> Result<SendOutcome, CoreError> {
        let blob = MessageBlob::parse(&row.blob)
            .map_err(|_| CoreError::Internal(anyhow::anyhow!("stored blob unparseable")))?;
        let envelope = outer(
            &row.kind,
            row.msg_id(),
            &row.sender_fp,
            &row.recipient_fp,
            row.created_at,
            &fresh_nonce(),
            &blob.payload_b64,
        );

        // Note-to-self rows retry over loopback.
        if row.recipient_fp == row.sender_fp {
            return self.post_loopback(&row.id, row.attempts, &envelope).await;
        }

        let Some(contact) =
            contacts::find(&self.store, &row.recipient_fp).await.map_err(internal)?
        else {
            messages::mark_failed(&self.store, &row.id, &SendOutcome::FailedMissingAddress.code())
                .await
                .map_err(internal)?;
            return Ok(SendOutcome::FailedMissingAddress);
        };
        self.deliver(&row.id, row.attempts, contact.onion.as_ref(), &envelope).await
    }

    async fn send_to_self(
        &self,
        identity: &echomesh_common::models::Identity,
        keyring: &Keyring,
        body: &str,
    ) -> Result<SendOutcome, CoreError> {
        let msg_id = uuid::Uuid::new_v4().to_string();
        let nonce = fresh_nonce();
        let created_at = now_millis();
        let inner = InnerPayload::message(&msg_id, identity.fingerprint.as_str(), body, None);

        let payload_b64 = match self.seal(&inner, &[&keyring.public_ring()], keyring) {
            Ok(p) => p,
            Err(_) => return Ok(SendOutcome::FailedCryptoError),
        };

        let row_id = self
            .persist_queued(
                identity,
                &identity.fingerprint,
                &msg_id,
                created_at,
                TYPE_MSG,
                &payload_b64,
            )
            .await?;
        let envelope = outer(
            TYPE_MSG,
            &msg_id,
            &identity.fingerprint,
            &identity.fingerprint,
            created_at,
            &nonce,
            &payload_b64,
        );
        self.post_loopback(&row_id, 0, &envelope).await
    }

    async fn identity_and_keyring(
        &self,
    ) -> Result<(echomesh_common::models::Identity, Keyring), CoreError> {
        let identity = identities::find_active(&self.store)
            .await
            .map_err(internal)?
            .ok_or(CoreError::LocalIdentityMissing)?;
        let sealed = std::str::from_utf8(&identity.sealed_secret_ring)
            .map_err(|_| CoreError::EncryptFail)?;
        let keyring = Keyring::unseal(&self.kek, sealed).map_err(|_| CoreError::EncryptFail)?;
        Ok((identity, keyring))
    }

    fn seal(
        &self,
        inner: &InnerPayload,
        recipients: &[&PublicRing],
        keyring: &Keyring,
    ) -> Result<String, CoreError> {
        let plaintext = serde_json::to_vec(inner).map_err(|e| CoreError::Internal(e.into()))?;
        let sealed = self
            .codec
            .encrypt_and_sign(&plaintext, recipients, keyring)
            .map_err(|_| CoreError::EncryptFail)?;
        let payload_b64: String =
            B64.encode(sealed).chars().filter(|c| !c.is_whitespace()).collect();
        if payload_b64.is_empty() || payload_b64.len() > MAX_PAYLOAD_B64_LEN {
            return Err(CoreError::EncryptFail);
        }
        Ok(payload_b64)
    }

    async fn persist_queued(
        &self,
        identity: &echomesh_common::models::Identity,
        to_fp: &Fingerprint,
        msg_id: &str,
        created_at: i64,
        kind: &str,
        payload_b64: &str,
    ) -> Result<String, CoreError> {
        let row = Message {
            id: Message::db_id(Direction::Out, msg_id),
            conv_id: to_fp.clone(),
            direction: Direction::Out,
            sender_fp: identity.fingerprint.clone(),
            recipient_fp: to_fp.clone(),
            created_at,
            server_received_at: 0,
            status: MessageStatus::Queued,
            attempts: 0,
            last_error: None,
            next_retry_at: 0,
            kind: kind.to_owned(),
            blob: MessageBlob::outbound(payload_b64.to_owned()).encode(),
        };
        messages::insert(&self.store, &row).await.map_err(internal)?;
        Ok(row.id)
    }

    async fn deliver(
        &self,
        row_id: &str,
        attempts: i64,
        address: Option<&OnionAddr>,
        envelope: &OuterEnvelope,
    ) -> Result<SendOutcome, CoreError> {
        let Some(address) = address else {
            return self.terminal(row_id, SendOutcome::FailedMissingAddress).await;
        };
        match classify_address(address.as_str()) {
            AddressKind::Bad => self.terminal(row_id, SendOutcome::FailedBadAddress).await,
            AddressKind::Direct(host) => {
                if !self.allow_direct_http {
                    return self.terminal(row_id, SendOutcome::FailedBlockedDirectHttp).await;
                }
                let client = self.loopback.clone();
                self.post(&client, &host, row_id, attempts, envelope).await
            }
            AddressKind::Onion(onion) => {
                let client = self.socks.read().expect("socks lock").clone();
                let Some(client) = client else {
                    return self.retryable(row_id, attempts, SendOutcome::QueuedTorNotReady).await;
                };
                self.post(&client, onion.as_str(), row_id, attempts, envelope).await
            }
        }
    }

    async fn post_loopback(
        &self,
        row_id: &str,
        attempts: i64,
        envelope: &OuterEnvelope,
    ) -> Result<SendOutcome, CoreError> {
        let port = self.loopback_port.load(Ordering::Relaxed);
        if port == 0 {
            return self.retryable(row_id, attempts, SendOutcome::QueuedLocalNotReady).await;
        }
        let client = self.loopback.clone();
        self.post(&client, &format!("127.0.0.1:{port}"), row_id, attempts, envelope).await
    }

    async fn post(
        &self,
        client: &reqwest::Client,
        host: &str,
        row_id: &str,
        attempts: i64,
        envelope: &OuterEnvelope,
    ) -> Result<SendOutcome, CoreError> {
        let url = format!("http://{host}/v1/messages");
        match client.post(&url).json(envelope).send().await {
            Ok(resp) if resp.status().is_success() => {
                messages::mark_sent(&self.store, row_id).await.map_err(internal)?;
                Ok(SendOutcome::Sent)
            }
            Ok(resp) => {
                let code = resp.status().as_u16();
                self.retryable(row_id, attempts, SendOutcome::QueuedHttpFail(code)).await
            }
            Err(e) => {
                tracing::debug!("post to peer failed: {e}");
                self.retryable(row_id, attempts, SendOutcome::QueuedHttpFail(0)).await
            }
        }
    }

    async fn terminal(&self, row_id: &str, outcome: SendOutcome) -> Result<SendOutcome, CoreError> {
        messages::mark_failed(&self.store, row_id, &outcome.code()).await.map_err(internal)?;
        Ok(outcome)
    }

    async fn retryable(
        &self,
        row_id: &str,
        attempts: i64,
        outcome: SendOutcome,
    ) -> Result<SendOutcome, CoreError> {
        let next = next_retry_at(now_millis(), attempts);
        messages::mark_queued_retry(&self.store, row_id, &outcome.code(), next)
            .await
            .map_err(internal)?;
        Ok(outcome)
    }
}

fn outer(
    kind: &str,
    msg_id: &str,
    sender: &Fingerprint,
    recipient: &Fingerprint,
    created_at: i64,
    nonce: &str,
    payload_b64: &str,
) -> OuterEnvelope {
    OuterEnvelope {
        v: 1,
        kind: kind.to_owned(),
        msg_id: msg_id.to_owned(),
        sender_fp: sender.as_str().to_owned(),
        recipient_fp: recipient.as_str().to_owned(),
        created_at,
        nonce: nonce.to_owned(),
        payload_pgp: payload_b64.to_owned(),
        debug_plaintext: None,
    }
}

fn fresh_nonce() -> String {
    URL_SAFE_NO_PAD.encode(echomesh_crypto::random_array::<NONCE_LEN>())
}

/// Exponential per-row backoff.
fn next_retry_at(now: i64, attempts: i64) -> i64 {
    let shift = attempts.clamp(0, 6) as u32;
    now + (RETRY_BASE_MS << shift).min(RETRY_CAP_MS)
}

fn internal(e: echomesh_db::StoreError) -> CoreError {
    CoreError::Internal(anyhow::Error::from(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::IdentityVault;
    use echomesh_common::models::ContactDraft;
    use echomesh_crypto::SealedEnvelopeCodec;

    fn onion(c: char) -> String {
        format!("{}.onion", c.to_string().repeat(56))
    }

    #[test]
    fn address_classification() {
        assert!(matches!(classify_address(&onion('a')), AddressKind::Onion(_)));
        assert!(matches!(
            classify_address(&format!("{}:8080", onion('a'))),
            AddressKind::Onion(_)
        ));
        assert!(matches!(classify_address("example.com"), AddressKind::Direct(_)));
        assert!(matches!(classify_address("example.com:8080"), AddressKind::Direct(_)));
        // URL structure without a scheme is ambiguous
        assert_eq!(classify_address("example.com/path"), AddressKind::Bad);
        assert_eq!(classify_address("example.com?q=1"), AddressKind::Bad);
        assert_eq!(classify_address("user@example.com"), AddressKind::Bad);
        assert_eq!(classify_address("http://example.com"), AddressKind::Bad);
        assert_eq!(classify_address("example.com:0"), AddressKind::Bad);
        assert_eq!(classify_address(""), AddressKind::Bad);
    }

    #[test]
    fn retry_backoff_doubles_and_caps() {
        let base = next_retry_at(0, 0);
        assert_eq!(base, RETRY_BASE_MS);
        assert_eq!(next_retry_at(0, 1), RETRY_BASE_MS * 2);
        assert_eq!(next_retry_at(0, 3), RETRY_BASE_MS * 8);
        assert_eq!(next_retry_at(0, 50), RETRY_CAP_MS);
    }

    async fn sender_with_identity() -> (Arc<OutboundSender>, Store, Arc<DeviceKek>) {
        let store = Store::open_in_memory().await.unwrap();
        let kek = Arc::new(DeviceKek::from_bytes([4u8; 32]));
        IdentityVault::new(store.clone(), Arc::clone(&kek))
            .ensure_identity()
            .await
            .unwrap();
        let sender = OutboundSender::new(
            store.clone(),
            Arc::clone(&kek),
            Arc::new(SealedEnvelopeCodec),
            false,
        );
        (sender, store, kek)
    }

    async fn add_contact(
        store: &Store,
        with_onion: Option<&str>,
        verified: bool,
    ) -> Fingerprint {
        let peer = Keyring::generate();
        let draft = ContactDraft::validate(
            &peer.fingerprint(),
            with_onion,
            peer.public_ring().to_bytes(),
            None,
            None,
        )
        .unwrap();
        contacts::upsert_merge_safe(store, &draft, now_millis()).await.unwrap();
        if verified {
            contacts::mark_verified(store, &draft.fingerprint).await.unwrap();
        }
        draft.fingerprint
    }

    #[tokio::test]
    async fn unverified_contact_is_a_terminal_outcome() {
        let (sender, store, _) = sender_with_identity().await;
        let fp = add_contact(&store, Some(&onion('a')), false).await;
        let outcome = sender.send_message(fp.as_str(), "hi").await.unwrap();
        assert_eq!(outcome, SendOutcome::FailedContactNotVerified);
    }

    #[tokio::test]
    async fn missing_address_marks_row_failed() {
        let (sender, store, _) = sender_with_identity().await;
        let fp = add_contact(&store, None, true).await;
        let outcome = sender.send_message(fp.as_str(), "hi").await.unwrap();
        assert_eq!(outcome, SendOutcome::FailedMissingAddress);

        let rows = messages::list_conversation(&store, &fp, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, MessageStatus::Failed);
        assert_eq!(rows[0].last_error.as_deref(), Some("FAILED_MISSING_ADDRESS"));
        assert!(rows[0].id.starts_with("OUT:"));
    }

    #[tokio::test]
    async fn onion_without_socks_queues_for_retry() {
        let (sender, store, _) = sender_with_identity().await;
        let fp = add_contact(&store, Some(&onion('b')), true).await;
        let outcome = sender.send_message(fp.as_str(), "hi").await.unwrap();
        assert_eq!(outcome, SendOutcome::QueuedTorNotReady);

        let rows = messages::list_conversation(&store, &fp, 10).await.unwrap();
        assert_eq!(rows[0].status, MessageStatus::Queued);
        assert_eq!(rows[0].last_error.as_deref(), Some("QUEUED_TOR_NOT_READY"));
        assert_eq!(rows[0].attempts, 1);
        assert!(rows[0].next_retry_at > now_millis() - 1000);
        // the row stays visible for the sweeper
        let due = messages::due_retries(&store, rows[0].next_retry_at, 10).await.unwrap();
        assert_eq!(due.len(), 1);
    }

    #[tokio::test]
    async fn note_to_self_without_ingress_queues_local() {
        let (sender, store, _) = sender_with_identity().await;
        let identity = identities::find_active(&store).await.unwrap().unwrap();
        let outcome =
            sender.send_message(identity.fingerprint.as_str(), "note").await.unwrap();
        assert_eq!(outcome, SendOutcome::QueuedLocalNotReady);

        let rows =
            messages::list_conversation(&store, &identity.fingerprint, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].conv_id, identity.fingerprint);
        assert_eq!(rows[0].direction, Direction::Out);
    }

    #[tokio::test]
    async fn outbound_blob_has_no_plaintext_slot() {
        let (sender, store, _) = sender_with_identity().await;
        let fp = add_contact(&store, Some(&onion('b')), true).await;
        sender.send_message(fp.as_str(), "secret body").await.unwrap();

        let rows = messages::list_conversation(&store, &fp, 10).await.unwrap();
        let blob = MessageBlob::parse(&rows[0].blob).unwrap();
        assert!(blob.plaintext_b64.is_none());
        assert!(!rows[0].blob.contains("secret body"));
    }

    #[tokio::test]
    async fn addr_update_rows_carry_their_kind() {
        let (sender, store, _) = sender_with_identity().await;
        let fp = add_contact(&store, Some(&onion('b')), true).await;
        let outcome =
            sender.send_addr_update(fp.as_str(), &onion('c')).await.unwrap();
        assert_eq!(outcome, SendOutcome::QueuedTorNotReady);

        let rows = messages::list_conversation(&store, &fp, 10).await.unwrap();
        assert_eq!(rows[0].kind, TYPE_ADDR_UPDATE);
    }
}
