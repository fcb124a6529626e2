//! Messages and the on-disk ciphertext blob format.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::Fingerprint;

/// Database-id prefix for outbound rows.
///
/// In and Out halves of a self-message share the same protocol `msg_id`;
/// storing the outbound half under `OUT:<msg_id>` keeps the two rows from
/// colliding on the primary key.
pub const OUT_ID_PREFIX: &str = "OUT:";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::In => 0,
            Self::Out => 1,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        if v == 1 { Self::Out } else { Self::In }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageStatus {
    /// Persisted, not yet delivered; the retry sweeper may re-drive it.
    Queued,
    SentOk,
    /// Terminal delivery failure; never retried.
    Failed,
    Received,
}

impl MessageStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Queued => 0,
            Self::SentOk => 1,
            Self::Failed => 2,
            Self::Received => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::SentOk,
            2 => Self::Failed,
            3 => Self::Received,
            _ => Self::Queued,
        }
    }
}

/// A stored message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Database id: the protocol `msg_id` for inbound rows, `OUT:<msg_id>`
    /// for outbound rows.
    pub id: String,
    /// Conversation key: the peer's fingerprint, or this device's own
    /// fingerprint for a note-to-self.
    pub conv_id: Fingerprint,
    pub direction: Direction,
    pub sender_fp: Fingerprint,
    pub recipient_fp: Fingerprint,
    pub created_at: i64,
    /// When the loopback ingress accepted the envelope; 0 if never set.
    pub server_received_at: i64,
    pub status: MessageStatus,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub next_retry_at: i64,
    /// Outer envelope type this row travels as (`msg` or `addr_update`);
    /// the retry sweeper rebuilds the envelope from it.
    pub kind: String,
    /// Ciphertext blob — the only authoritative payload. See [`MessageBlob`].
    pub blob: String,
}

impl Message {
    /// Database id for a row with the given direction and protocol msg id.
    pub fn db_id(direction: Direction, msg_id: &str) -> String {
        match direction {
            Direction::In => msg_id.to_owned(),
            Direction::Out => format!("{OUT_ID_PREFIX}{msg_id}"),
        }
    }

    /// Protocol msg id of this row (database id with any `OUT:` prefix
    /// removed).
    pub fn msg_id(&self) -> &str {
        self.id.strip_prefix(OUT_ID_PREFIX).unwrap_or(&self.id)
    }

    /// The ordering key for conversation listings.
    pub fn sort_key(&self) -> i64 {
        self.server_received_at.max(self.created_at)
    }
}

/// The persisted blob column: `v1|pgp=<b64>` for outbound rows, with an
/// additional `|pt=<b64-json>` slot for inbound rows carrying the decrypted
/// body for rendering.
///
/// The `pt` slot is a convenience only; the sealed payload stays
/// authoritative and the plaintext slot never feeds a security decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBlob {
    pub payload_b64: String,
    pub plaintext_b64: Option<String>,
}

impl MessageBlob {
    pub fn outbound(payload_b64: String) -> Self {
        Self { payload_b64, plaintext_b64: None }
    }

    pub fn inbound(payload_b64: String, plaintext_b64: String) -> Self {
        Self { payload_b64, plaintext_b64: Some(plaintext_b64) }
    }

    pub fn encode(&self) -> String {
        match &self.plaintext_b64 {
            Some(pt) => format!("v1|pgp={}|pt={}", self.payload_b64, pt),
            None => format!("v1|pgp={}", self.payload_b64),
        }
    }

    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let mut parts = raw.split('|');
        if parts.next() != Some("v1") {
            return Err(CoreError::BadRequest { message: "unknown blob version".into() });
        }
        let payload = parts
            .next()
            .and_then(|p| p.strip_prefix("pgp="))
            .ok_or(CoreError::BadRequest { message: "missing payload slot".into() })?;
        let plaintext = match parts.next() {
            Some(p) => Some(
                p.strip_prefix("pt=")
                    .ok_or(CoreError::BadRequest { message: "bad plaintext slot".into() })?
                    .to_owned(),
            ),
            None => None,
        };
        Ok(Self { payload_b64: payload.to_owned(), plaintext_b64: plaintext })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_round_trip() {
        let out = MessageBlob::outbound("QUJD".into());
        assert_eq!(out.encode(), "v1|pgp=QUJD");
        assert_eq!(MessageBlob::parse("v1|pgp=QUJD").unwrap(), out);

        let inb = MessageBlob::inbound("QUJD".into(), "e30".into());
        assert_eq!(inb.encode(), "v1|pgp=QUJD|pt=e30");
        assert_eq!(MessageBlob::parse("v1|pgp=QUJD|pt=e30").unwrap(), inb);
    }

    #[test]
    fn blob_rejects_unknown_version() {
        assert!(MessageBlob::parse("v2|pgp=QUJD").is_err());
        assert!(MessageBlob::parse("pgp=QUJD").is_err());
        assert!(MessageBlob::parse("v1|xx=QUJD").is_err());
    }

    #[test]
    fn out_rows_get_distinct_ids() {
        assert_eq!(Message::db_id(Direction::In, "abc"), "abc");
        assert_eq!(Message::db_id(Direction::Out, "abc"), "OUT:abc");
    }
}
