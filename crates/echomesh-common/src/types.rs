//! Canonical identifier newtypes.
//!
//! [`Fingerprint`] and [`OnionAddr`] can only be constructed through the
//! canonicalization path, so holding one is proof the value is in canonical
//! form. Both serialize as their canonical string.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::error::CoreError;
use crate::validation::{canonical_fingerprint, canonical_onion};

/// A canonical 40-hex-uppercase key fingerprint, the identity root of a
/// device or contact.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Canonicalize and validate a raw fingerprint string.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        Ok(Self(canonical_fingerprint(raw)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Fingerprint::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// A canonical v3 onion address: 56-char base32 host plus `.onion`, with an
/// optional port in `1..=65535`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct OnionAddr(String);

impl OnionAddr {
    /// Canonicalize and validate a raw onion address string.
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        Ok(Self(canonical_onion(raw)?))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The bare host part (without any `:port`).
    pub fn host(&self) -> &str {
        self.0.split(':').next().unwrap_or(&self.0)
    }

    /// The explicit port, if one was given.
    pub fn port(&self) -> Option<u16> {
        self.0.split_once(':').and_then(|(_, p)| p.parse().ok())
    }

    /// The v3 service id: the host without the `.onion` suffix.
    pub fn service_id(&self) -> &str {
        self.host().trim_end_matches(".onion")
    }
}

impl fmt::Display for OnionAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for OnionAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl<'de> Deserialize<'de> for OnionAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        OnionAddr::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn onion_accessors() {
        let host = "b".repeat(56);
        let addr = OnionAddr::parse(&format!("{host}.onion:8443")).unwrap();
        assert_eq!(addr.host(), format!("{host}.onion"));
        assert_eq!(addr.port(), Some(8443));
        assert_eq!(addr.service_id(), host);

        let bare = OnionAddr::parse(&format!("{host}.onion")).unwrap();
        assert_eq!(bare.port(), None);
    }

    #[test]
    fn fingerprint_serde_round_trip() {
        let fp = Fingerprint::parse(&"c".repeat(40)).unwrap();
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", "C".repeat(40)));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn fingerprint_deserialize_rejects_junk() {
        assert!(serde_json::from_str::<Fingerprint>("\"zz\"").is_err());
    }
}
