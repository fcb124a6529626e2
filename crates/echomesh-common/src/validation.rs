//! Canonicalization and validation of protocol identifiers.
//!
//! Every fingerprint, onion address, and invite token that enters the node
//! (from the wire, a QR scan, manual entry, or disk) passes through these
//! helpers before any trust or routing decision is made.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::CoreError;

/// Upper bound on `msg_id` length (characters).
pub const MAX_MSG_ID_LEN: usize = 128;
/// Upper bound on nonce length (characters).
pub const MAX_NONCE_LEN: usize = 256;
/// Upper bound on decrypted message body length (characters).
pub const MAX_BODY_CHARS: usize = 500;
/// Accepted clock skew for incoming `created_at` timestamps.
pub const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1000;

fn fingerprint_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[0-9A-F]{40}$").expect("static regex"))
}

fn onion_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z2-7]{56}\.onion(:[1-9][0-9]{0,4})?$").expect("static regex"))
}

fn token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{22,128}$").expect("static regex"))
}

/// Canonicalize a fingerprint: strip all whitespace, uppercase, then require
/// exactly 40 hex characters.
pub fn canonical_fingerprint(raw: &str) -> Result<String, CoreError> {
    let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let upper = cleaned.to_ascii_uppercase();
    if fingerprint_re().is_match(&upper) {
        Ok(upper)
    } else {
        Err(CoreError::InvalidFingerprint)
    }
}

/// Canonicalize a v3 onion address: trim, lowercase, then require the
/// 56-char base32 host with the `.onion` suffix and an optional port.
pub fn canonical_onion(raw: &str) -> Result<String, CoreError> {
    let lower = raw.trim().to_ascii_lowercase();
    if !onion_re().is_match(&lower) {
        return Err(CoreError::InvalidOnion);
    }
    // The regex admits up to five digits; cap the port at 65535 explicitly.
    if let Some((_, port)) = lower.split_once(':') {
        let port: u32 = port.parse().map_err(|_| CoreError::InvalidOnion)?;
        if port == 0 || port > 65535 {
            return Err(CoreError::InvalidOnion);
        }
    }
    Ok(lower)
}

/// Validate an invite token's shape (URL-safe base64 alphabet, 22–128 chars).
pub fn validate_token(token: &str) -> Result<(), CoreError> {
    if token_re().is_match(token) {
        Ok(())
    } else {
        Err(CoreError::InvalidToken)
    }
}

/// Validate a wire `msg_id`: non-empty, at most [`MAX_MSG_ID_LEN`] chars.
pub fn validate_msg_id(msg_id: &str) -> Result<(), CoreError> {
    if msg_id.is_empty() || msg_id.chars().count() > MAX_MSG_ID_LEN {
        return Err(CoreError::BadRequest { message: "invalid msg_id".into() });
    }
    Ok(())
}

/// Validate a wire nonce: non-empty, at most [`MAX_NONCE_LEN`] chars.
pub fn validate_nonce(nonce: &str) -> Result<(), CoreError> {
    if nonce.is_empty() || nonce.chars().count() > MAX_NONCE_LEN {
        return Err(CoreError::BadRequest { message: "invalid nonce".into() });
    }
    Ok(())
}

/// Validate an incoming `created_at`: positive and not further than the
/// accepted skew into the future. A timestamp of exactly `now + skew` passes.
pub fn validate_created_at(created_at: i64, now: i64) -> Result<(), CoreError> {
    if created_at <= 0 || created_at > now + MAX_CLOCK_SKEW_MS {
        return Err(CoreError::BadRequest { message: "invalid created_at".into() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_canonical_form() {
        let raw = " ab12 cd34 ef56 ab12 cd34 ef56 ab12 cd34 ef56 ab12 ";
        let fp = canonical_fingerprint(raw).unwrap();
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
    }

    #[test]
    fn fingerprint_length_is_exact() {
        assert!(canonical_fingerprint(&"A".repeat(39)).is_err());
        assert!(canonical_fingerprint(&"A".repeat(40)).is_ok());
        assert!(canonical_fingerprint(&"A".repeat(41)).is_err());
        assert!(canonical_fingerprint(&"G".repeat(40)).is_err());
    }

    #[test]
    fn onion_canonical_form() {
        let host = "a".repeat(56);
        assert_eq!(canonical_onion(&format!("  {}.ONION  ", host.to_uppercase())).unwrap(), format!("{host}.onion"));
        assert!(canonical_onion(&format!("{host}.onion:8080")).is_ok());
        assert!(canonical_onion(&format!("{}.onion", "a".repeat(55))).is_err());
        assert!(canonical_onion(&format!("{}.onion", "a".repeat(57))).is_err());
        assert!(canonical_onion(&format!("{host}.onion:0")).is_err());
        assert!(canonical_onion(&format!("{host}.onion:65535")).is_ok());
        assert!(canonical_onion(&format!("{host}.onion:65536")).is_err());
        // base32 alphabet excludes 0, 1, 8, 9
        assert!(canonical_onion(&format!("{}1.onion", "a".repeat(55))).is_err());
    }

    #[test]
    fn token_shape() {
        assert!(validate_token(&"a".repeat(22)).is_ok());
        assert!(validate_token(&"a".repeat(21)).is_err());
        assert!(validate_token(&"a".repeat(129)).is_err());
        assert!(validate_token("abc$def_ghi-jkl_mno-pqr").is_err());
    }

    #[test]
    fn created_at_skew_boundary() {
        let now = 1_700_000_000_000;
        assert!(validate_created_at(now + MAX_CLOCK_SKEW_MS, now).is_ok());
        assert!(validate_created_at(now + MAX_CLOCK_SKEW_MS + 1, now).is_err());
        assert!(validate_created_at(0, now).is_err());
    }
}
