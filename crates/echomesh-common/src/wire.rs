//! Wire formats: the outer transport envelope, the sealed inner payloads,
//! the invite acceptance document, and the runtime debug snapshot.
//!
//! These structures are bit-compatible constants of the protocol. Field
//! names, version numbers, and type tags must not change.

use serde::{Deserialize, Serialize};

/// Outer and inner envelope version.
pub const ENVELOPE_V: u8 = 1;
/// Invite acceptance document version.
pub const INVITE_ACCEPT_V: u8 = 2;

/// Envelope type tag: an end-to-end chat message.
pub const TYPE_MSG: &str = "msg";
/// Envelope type tag: a signed onion address rotation.
pub const TYPE_ADDR_UPDATE: &str = "addr_update";

/// The outer envelope POSTed to `/v1/messages`.
///
/// Everything here is transport metadata visible to the receiving node
/// before decryption; the payload itself stays sealed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OuterEnvelope {
    pub v: u8,
    #[serde(rename = "type")]
    pub kind: String,
    pub msg_id: String,
    pub sender_fp: String,
    pub recipient_fp: String,
    pub created_at: i64,
    pub nonce: String,
    /// Base64 of the sealed payload. Empty only on the debug plaintext path.
    #[serde(default)]
    pub payload_pgp: String,
    /// Debug-only plaintext body, accepted solely for self-to-self traffic
    /// in debug builds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_plaintext: Option<String>,
}

/// The decrypted inner payload.
///
/// One shape serves both envelope types; `kind` and the optional fields
/// discriminate. Serialization skips absent fields so the sealed plaintext
/// stays minimal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InnerPayload {
    pub v: u8,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    pub msg_id: String,
    pub conv_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_onion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_fp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_fp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_onion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_onion: Option<String>,
}

impl InnerPayload {
    /// Inner payload for a chat message. `conv_id` is the sender's own
    /// fingerprint; the receiver checks it against the outer `sender_fp`.
    pub fn message(msg_id: &str, conv_id: &str, body: &str, sender_onion: Option<&str>) -> Self {
        Self {
            v: ENVELOPE_V,
            kind: None,
            msg_id: msg_id.to_owned(),
            conv_id: conv_id.to_owned(),
            body: Some(body.to_owned()),
            sender_onion: sender_onion.map(str::to_owned),
            sender_fp: None,
            recipient_fp: None,
            ts: None,
            nonce: None,
            new_onion: None,
            old_onion: None,
        }
    }

    /// Inner payload for an address rotation announcement.
    #[allow(clippy::too_many_arguments)]
    pub fn addr_update(
        msg_id: &str,
        sender_fp: &str,
        recipient_fp: &str,
        ts_secs: i64,
        nonce: &str,
        new_onion: &str,
        old_onion: Option<&str>,
    ) -> Self {
        Self {
            v: ENVELOPE_V,
            kind: Some(TYPE_ADDR_UPDATE.to_owned()),
            msg_id: msg_id.to_owned(),
            conv_id: sender_fp.to_owned(),
            body: None,
            sender_onion: None,
            sender_fp: Some(sender_fp.to_owned()),
            recipient_fp: Some(recipient_fp.to_owned()),
            ts: Some(ts_secs),
            nonce: Some(nonce.to_owned()),
            new_onion: Some(new_onion.to_owned()),
            old_onion: old_onion.map(str::to_owned),
        }
    }
}

/// JSON stored in the `pt=` slot of an inbound blob for rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaintextBody {
    pub body: String,
}

/// The v=2 invite acceptance document returned by `GET /invite/<token>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteAccept {
    pub v: u8,
    pub ok: bool,
    #[serde(rename = "type")]
    pub kind: String,
    pub protocol: String,
    pub fingerprint: String,
    pub primary_onion: String,
    pub pub_b64: String,
    pub pub_fmt: String,
    pub ts: i64,
}

impl InviteAccept {
    pub fn new(fingerprint: &str, primary_onion: &str, pub_b64: &str, ts: i64) -> Self {
        Self {
            v: INVITE_ACCEPT_V,
            ok: true,
            kind: "invite_accept".to_owned(),
            protocol: "ec2".to_owned(),
            fingerprint: fingerprint.to_owned(),
            primary_onion: primary_onion.to_owned(),
            pub_b64: pub_b64.to_owned(),
            pub_fmt: "pgp".to_owned(),
            ts,
        }
    }
}

/// Optional debug state snapshot written to `runtime.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSnapshot {
    pub v: u8,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub onion: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socks_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_detail: Option<String>,
    pub ts: i64,
}
