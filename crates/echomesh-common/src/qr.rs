//! QR payload codecs.
//!
//! Two formats:
//!
//! * `ec1|<url-safe b64>` — a compact binary contact card:
//!   `"EC1"(3B) | ver(1B) | fpLen(u16 BE) | fpHex | onionLen(u16 BE) | onion |
//!   compLen(u32 BE) | zlib(pubkey) | sha256(payload)[0..4]`
//! * `ec2|<onion>|<token>` — an invite descriptor.
//!
//! Decoding is total: any structural defect, bad length, or checksum
//! mismatch yields `None` rather than a partial contact.

use std::io::{Read, Write};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};

use crate::types::OnionAddr;
use crate::validation::{canonical_fingerprint, canonical_onion, validate_token};

const EC1_PREFIX: &str = "ec1|";
const EC2_PREFIX: &str = "ec2|";
const EC1_MAGIC: &[u8; 3] = b"EC1";
const EC1_VERSION: u8 = 1;
const EC1_CHECKSUM_LEN: usize = 4;

/// Decompressed public-key cap; a zlib bomb stops here.
const MAX_PUBKEY_LEN: usize = 64 * 1024;

/// A contact card decoded from an `ec1` QR payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QrContact {
    pub fingerprint: String,
    /// Canonical onion, or `None` when the card was produced before the
    /// first hidden-service publish.
    pub onion: Option<String>,
    pub public_ring: Vec<u8>,
}

/// Encode a contact card as an `ec1|…` string.
pub fn encode_contact(fingerprint: &str, onion: Option<&str>, public_ring: &[u8]) -> String {
    let onion = onion.unwrap_or("");
    let mut compressed = Vec::new();
    {
        let mut enc = ZlibEncoder::new(&mut compressed, Compression::default());
        enc.write_all(public_ring).expect("write to Vec cannot fail");
        enc.finish().expect("write to Vec cannot fail");
    }

    let mut payload = Vec::with_capacity(
        EC1_MAGIC.len() + 1 + 2 + fingerprint.len() + 2 + onion.len() + 4 + compressed.len(),
    );
    payload.extend_from_slice(EC1_MAGIC);
    payload.push(EC1_VERSION);
    payload.extend_from_slice(&(fingerprint.len() as u16).to_be_bytes());
    payload.extend_from_slice(fingerprint.as_bytes());
    payload.extend_from_slice(&(onion.len() as u16).to_be_bytes());
    payload.extend_from_slice(onion.as_bytes());
    payload.extend_from_slice(&(compressed.len() as u32).to_be_bytes());
    payload.extend_from_slice(&compressed);

    let digest = Sha256::digest(&payload);
    payload.extend_from_slice(&digest[..EC1_CHECKSUM_LEN]);

    format!("{EC1_PREFIX}{}", URL_SAFE_NO_PAD.encode(payload))
}

/// Decode an `ec1|…` string back into a contact card.
pub fn decode_contact(raw: &str) -> Option<QrContact> {
    let b64 = raw.trim().strip_prefix(EC1_PREFIX)?;
    let payload = URL_SAFE_NO_PAD.decode(b64).ok()?;
    if payload.len() < EC1_MAGIC.len() + 1 + 2 + 2 + 4 + EC1_CHECKSUM_LEN {
        return None;
    }

    let (body, checksum) = payload.split_at(payload.len() - EC1_CHECKSUM_LEN);
    let digest = Sha256::digest(body);
    if checksum != &digest[..EC1_CHECKSUM_LEN] {
        return None;
    }

    let mut cur = body;
    let magic = take(&mut cur, 3)?;
    if magic != EC1_MAGIC {
        return None;
    }
    let ver = take(&mut cur, 1)?[0];
    if ver != EC1_VERSION {
        return None;
    }

    let fp_len = u16::from_be_bytes(take(&mut cur, 2)?.try_into().ok()?) as usize;
    let fp_raw = std::str::from_utf8(take(&mut cur, fp_len)?).ok()?;
    let fingerprint = canonical_fingerprint(fp_raw).ok()?;

    let onion_len = u16::from_be_bytes(take(&mut cur, 2)?.try_into().ok()?) as usize;
    let onion_raw = std::str::from_utf8(take(&mut cur, onion_len)?).ok()?;
    let onion = if onion_raw.is_empty() {
        None
    } else {
        Some(canonical_onion(onion_raw).ok()?)
    };

    let comp_len = u32::from_be_bytes(take(&mut cur, 4)?.try_into().ok()?) as usize;
    let compressed = take(&mut cur, comp_len)?;
    if !cur.is_empty() {
        return None;
    }

    let mut public_ring = Vec::new();
    let mut dec = ZlibDecoder::new(compressed).take(MAX_PUBKEY_LEN as u64 + 1);
    dec.read_to_end(&mut public_ring).ok()?;
    if public_ring.is_empty() || public_ring.len() > MAX_PUBKEY_LEN {
        return None;
    }

    Some(QrContact { fingerprint, onion, public_ring })
}

fn take<'a>(cur: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
    if cur.len() < n {
        return None;
    }
    let (head, tail) = cur.split_at(n);
    *cur = tail;
    Some(head)
}

/// Encode an invite descriptor as `ec2|<onion>|<token>`.
pub fn encode_invite(onion: &OnionAddr, token: &str) -> String {
    format!("{EC2_PREFIX}{onion}|{token}")
}

/// Parse an `ec2|<onion>|<token>` invite descriptor.
pub fn decode_invite(raw: &str) -> Option<(OnionAddr, String)> {
    let rest = raw.trim().strip_prefix(EC2_PREFIX)?;
    let (onion_raw, token) = rest.split_once('|')?;
    let onion = OnionAddr::parse(onion_raw).ok()?;
    validate_token(token).ok()?;
    Some((onion, token.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_fp() -> String {
        "0123456789ABCDEF0123456789ABCDEF01234567".to_owned()
    }

    fn sample_onion() -> String {
        format!("{}.onion", "f".repeat(56))
    }

    #[test]
    fn ec1_round_trip() {
        let fp = sample_fp();
        let onion = sample_onion();
        let pubkey = vec![7u8; 200];
        let encoded = encode_contact(&fp, Some(&onion), &pubkey);
        assert!(encoded.starts_with("ec1|"));

        let card = decode_contact(&encoded).expect("round trip should decode");
        assert_eq!(card.fingerprint, fp);
        assert_eq!(card.onion.as_deref(), Some(onion.as_str()));
        assert_eq!(card.public_ring, pubkey);
    }

    #[test]
    fn ec1_round_trip_without_onion() {
        let encoded = encode_contact(&sample_fp(), None, b"keydata");
        let card = decode_contact(&encoded).unwrap();
        assert_eq!(card.onion, None);
        assert_eq!(card.public_ring, b"keydata");
    }

    #[test]
    fn ec1_checksum_mismatch_is_none() {
        let encoded = encode_contact(&sample_fp(), Some(&sample_onion()), b"keydata");
        let mut payload = URL_SAFE_NO_PAD.decode(&encoded["ec1|".len()..]).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0xFF;
        let tampered = format!("ec1|{}", URL_SAFE_NO_PAD.encode(payload));
        assert_eq!(decode_contact(&tampered), None);
    }

    #[test]
    fn ec1_truncation_is_none() {
        let encoded = encode_contact(&sample_fp(), Some(&sample_onion()), b"keydata");
        assert_eq!(decode_contact(&encoded[..encoded.len() / 2]), None);
        assert_eq!(decode_contact("ec1|"), None);
        assert_eq!(decode_contact("notaqr"), None);
    }

    #[test]
    fn ec2_round_trip() {
        let onion = OnionAddr::parse(&sample_onion()).unwrap();
        let token = "A".repeat(32);
        let desc = encode_invite(&onion, &token);
        let (o, t) = decode_invite(&desc).unwrap();
        assert_eq!(o, onion);
        assert_eq!(t, token);
    }

    #[test]
    fn ec2_rejects_bad_pieces() {
        assert_eq!(decode_invite("ec2|short.onion|AAAAAAAAAAAAAAAAAAAAAA"), None);
        assert_eq!(decode_invite(&format!("ec2|{}|tooshort", sample_onion())), None);
        assert_eq!(decode_invite("ec1|whatever"), None);
    }
}
