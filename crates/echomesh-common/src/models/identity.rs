//! The device's own long-lived identity.

use serde::{Deserialize, Serialize};

use crate::types::{Fingerprint, OnionAddr};

/// The single active identity of this device.
///
/// Created once on first run. The fingerprint never changes within the
/// identity's lifetime; the onion is rebound whenever the hidden service is
/// (re)published. The secret ring is sealed under the device key-encryption
/// key before it ever reaches this struct; it is only opened on demand at
/// the crypto boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub fingerprint: Fingerprint,
    /// Currently published onion; `None` before the first publish.
    pub onion: Option<OnionAddr>,
    /// Serialized public key ring.
    pub public_ring: Vec<u8>,
    /// Secret key ring, sealed under the device KEK.
    pub sealed_secret_ring: Vec<u8>,
    pub active: bool,
    pub created_at: i64,
}

impl Identity {
    /// Whether this identity has a published, canonical onion bound to it.
    pub fn has_valid_onion(&self) -> bool {
        self.onion.is_some()
    }
}
