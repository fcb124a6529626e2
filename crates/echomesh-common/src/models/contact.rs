//! Contacts: the curated peer set with TOFU + pinning trust semantics.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::{Fingerprint, OnionAddr};

/// Trust level of a contact.
///
/// `Unverified` rows refresh in place on divergence (trust-on-first-use).
/// `Verified` rows are pinned: divergence lands in the pending slots and
/// waits for explicit user approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrustLevel {
    Unverified,
    Verified,
}

impl TrustLevel {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Unverified => 0,
            Self::Verified => 1,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        if v == 1 { Self::Verified } else { Self::Unverified }
    }
}

/// Which pinned fields currently have a divergent pending value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeState {
    None,
    KeyChanged,
    OnionChanged,
    Both,
}

impl ChangeState {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::None => 0,
            Self::KeyChanged => 1,
            Self::OnionChanged => 2,
            Self::Both => 3,
        }
    }

    pub fn from_i64(v: i64) -> Self {
        match v {
            1 => Self::KeyChanged,
            2 => Self::OnionChanged,
            3 => Self::Both,
            _ => Self::None,
        }
    }

    /// Combine an existing change state with newly observed divergence.
    /// Used when an onion update arrives while a key change is still pending
    /// (and vice versa).
    pub fn compose(self, key_changed: bool, onion_changed: bool) -> Self {
        let key = key_changed || matches!(self, Self::KeyChanged | Self::Both);
        let onion = onion_changed || matches!(self, Self::OnionChanged | Self::Both);
        match (key, onion) {
            (true, true) => Self::Both,
            (true, false) => Self::KeyChanged,
            (false, true) => Self::OnionChanged,
            (false, false) => Self::None,
        }
    }
}

/// A peer this device is willing to exchange envelopes with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub fingerprint: Fingerprint,
    /// Currently pinned onion address.
    pub onion: Option<OnionAddr>,
    /// Currently pinned public key ring.
    pub public_ring: Vec<u8>,
    /// Local-only label. Never transmitted, never part of any cryptographic
    /// decision.
    pub display_name: Option<String>,
    pub trust: TrustLevel,
    pub change_state: ChangeState,
    /// Divergent onion observed while the contact was pinned.
    pub pending_onion: Option<OnionAddr>,
    /// Divergent key ring observed while the contact was pinned.
    pub pending_public_ring: Option<Vec<u8>>,
    pub created_at: i64,
}

impl Contact {
    pub fn is_verified(&self) -> bool {
        self.trust == TrustLevel::Verified
    }
}

/// Outcome of a transactional merge-safe contact upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No row existed; inserted as `Unverified`.
    Inserted,
    /// Row existed and neither onion nor key differed.
    NoChange,
    /// Row existed, was `Unverified`, and the differing fields were refreshed
    /// in place.
    UpdatedUnverified,
    /// Row existed and was `Verified`; the divergence was parked in the
    /// pending slots.
    PendingApproval { key_changed: bool, onion_changed: bool },
}

/// A not-yet-trusted contact observation, as produced by any of the import
/// entry points (QR scan, manual entry, import request, invite acceptance).
///
/// All entry points converge on [`ContactDraft::validate`], so every path is
/// subject to identical canonicalization and the same trust rules downstream.
#[derive(Debug, Clone)]
pub struct ContactDraft {
    pub fingerprint: Fingerprint,
    pub onion: Option<OnionAddr>,
    pub public_ring: Vec<u8>,
    pub display_name: Option<String>,
}

impl ContactDraft {
    /// Canonicalize raw import fields into a draft.
    ///
    /// `self_fingerprint` guards against importing this device as its own
    /// contact, which every entry point must reject identically.
    pub fn validate(
        raw_fingerprint: &str,
        raw_onion: Option<&str>,
        public_ring: Vec<u8>,
        display_name: Option<String>,
        self_fingerprint: Option<&Fingerprint>,
    ) -> Result<Self, CoreError> {
        let fingerprint = Fingerprint::parse(raw_fingerprint)?;
        if let Some(own) = self_fingerprint {
            if own == &fingerprint {
                return Err(CoreError::SelfContactNotAllowed);
            }
        }
        let onion = match raw_onion {
            Some(o) if !o.trim().is_empty() => Some(OnionAddr::parse(o)?),
            _ => None,
        };
        if public_ring.is_empty() {
            return Err(CoreError::BadRequest { message: "empty public key".into() });
        }
        let display_name = display_name
            .map(|n| n.trim().to_owned())
            .filter(|n| !n.is_empty());
        Ok(Self { fingerprint, onion, public_ring, display_name })
    }
}
