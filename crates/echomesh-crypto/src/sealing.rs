//! Device-bound sealing of secret material at rest.
//!
//! Stable format: `"v1:" + base64(iv(12) || AES-256-GCM ciphertext)`. Any
//! payload lacking the prefix, or whose decoded form cannot contain a
//! 12-byte IV plus a tag, is rejected without touching the cipher.
//!
//! The device key-encryption key (KEK) is a random 32-byte key created on
//! first run and stored with owner-only permissions. Everything long-lived
//! and secret — the identity secret ring, the hidden-service key, the store
//! master key — is sealed under it before reaching disk.

use std::fs;
use std::io;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use zeroize::Zeroizing;

use crate::random_array;

/// Sentinel prefix of the sealed format.
pub const SEALED_PREFIX: &str = "v1:";
const IV_LEN: usize = 12;
const TAG_LEN: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("sealed payload has an unknown format")]
    Format,
    #[error("sealed payload failed to open")]
    Crypto,
    #[error("key file io: {0}")]
    Io(#[from] io::Error),
}

/// Seal `plain` under a 32-byte key into the `"v1:"` format.
pub fn seal_with_key(key: &[u8; 32], plain: &[u8]) -> Result<String, SealError> {
    let iv = random_array::<IV_LEN>();
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let ct = cipher
        .encrypt(Nonce::from_slice(&iv), plain)
        .map_err(|_| SealError::Crypto)?;

    let mut packed = Vec::with_capacity(IV_LEN + ct.len());
    packed.extend_from_slice(&iv);
    packed.extend_from_slice(&ct);
    Ok(format!("{SEALED_PREFIX}{}", B64.encode(packed)))
}

/// Open a `"v1:"`-sealed payload. The returned buffer zeroizes on drop.
pub fn open_with_key(key: &[u8; 32], sealed: &str) -> Result<Zeroizing<Vec<u8>>, SealError> {
    let b64 = sealed.strip_prefix(SEALED_PREFIX).ok_or(SealError::Format)?;
    let packed = B64.decode(b64.trim()).map_err(|_| SealError::Format)?;
    if packed.len() < IV_LEN + TAG_LEN {
        return Err(SealError::Format);
    }
    let (iv, ct) = packed.split_at(IV_LEN);

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let plain = cipher
        .decrypt(Nonce::from_slice(iv), ct)
        .map_err(|_| SealError::Crypto)?;
    Ok(Zeroizing::new(plain))
}

/// The device key-encryption key.
pub struct DeviceKek {
    key: Zeroizing<[u8; 32]>,
}

impl DeviceKek {
    /// Load the KEK from `path`, creating it on first run.
    pub fn load_or_create(path: &Path) -> Result<Self, SealError> {
        if path.exists() {
            let bytes = Zeroizing::new(fs::read(path)?);
            let key: [u8; 32] = bytes
                .as_slice()
                .try_into()
                .map_err(|_| SealError::Format)?;
            return Ok(Self { key: Zeroizing::new(key) });
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let key = random_array::<32>();
        fs::write(path, key)?;
        restrict_permissions(path)?;
        tracing::info!("Created device key-encryption key");
        Ok(Self { key: Zeroizing::new(key) })
    }

    /// A KEK from raw bytes, for tests and in-memory stores.
    pub fn from_bytes(key: [u8; 32]) -> Self {
        Self { key: Zeroizing::new(key) }
    }

    pub fn seal(&self, plain: &[u8]) -> Result<String, SealError> {
        seal_with_key(&self.key, plain)
    }

    pub fn open(&self, sealed: &str) -> Result<Zeroizing<Vec<u8>>, SealError> {
        open_with_key(&self.key, sealed)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let kek = DeviceKek::from_bytes([9u8; 32]);
        let sealed = kek.seal(b"secret ring bytes").unwrap();
        assert!(sealed.starts_with("v1:"));
        let opened = kek.open(&sealed).unwrap();
        assert_eq!(opened.as_slice(), b"secret ring bytes");
    }

    #[test]
    fn missing_prefix_is_rejected() {
        let kek = DeviceKek::from_bytes([9u8; 32]);
        let sealed = kek.seal(b"x").unwrap();
        let stripped = sealed.trim_start_matches("v1:");
        assert!(matches!(kek.open(stripped), Err(SealError::Format)));
    }

    #[test]
    fn short_payload_is_rejected_before_decrypt() {
        let kek = DeviceKek::from_bytes([9u8; 32]);
        let sealed = format!("v1:{}", B64.encode([0u8; IV_LEN + TAG_LEN - 1]));
        assert!(matches!(kek.open(&sealed), Err(SealError::Format)));
    }

    #[test]
    fn wrong_key_fails_closed() {
        let kek = DeviceKek::from_bytes([9u8; 32]);
        let other = DeviceKek::from_bytes([10u8; 32]);
        let sealed = kek.seal(b"secret").unwrap();
        assert!(matches!(other.open(&sealed), Err(SealError::Crypto)));
    }

    #[test]
    fn kek_file_round_trip() {
        let dir = std::env::temp_dir().join(format!("emkek-{}", std::process::id()));
        let path = dir.join("device.kek");
        let kek = DeviceKek::load_or_create(&path).unwrap();
        let sealed = kek.seal(b"persisted").unwrap();

        let again = DeviceKek::load_or_create(&path).unwrap();
        assert_eq!(again.open(&sealed).unwrap().as_slice(), b"persisted");
        let _ = std::fs::remove_dir_all(dir);
    }
}
