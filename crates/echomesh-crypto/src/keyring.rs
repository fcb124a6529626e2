//! The device keyring: signing primary + encryption subkey.
//!
//! The primary key signs envelopes; the subkey receives them. Keeping the
//! two roles on distinguishable keys lets a peer pin the signing identity
//! while the encryption half could, in principle, rotate independently.
//!
//! # Serialized rings
//! * Public ring: `"EPK1" | sign_pub(32) | enc_pub(32)` — 68 bytes.
//! * Secret ring: `"ESK1" | sign_seed(32) | enc_secret(32)` — 68 bytes.
//!
//! The secret ring never touches disk unsealed; callers run it through
//! [`crate::sealing`] first.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519Public, StaticSecret};
use zeroize::Zeroizing;

use crate::envelope::CodecError;

const PUBLIC_RING_MAGIC: &[u8; 4] = b"EPK1";
const SECRET_RING_MAGIC: &[u8; 4] = b"ESK1";
const RING_LEN: usize = 4 + 32 + 32;

/// The public half of a keyring, as pinned for contacts and published in
/// QR cards and invite acceptances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicRing {
    sign_pub: VerifyingKey,
    enc_pub: X25519Public,
}

impl PublicRing {
    /// Parse a serialized public ring.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != RING_LEN || &bytes[..4] != PUBLIC_RING_MAGIC {
            return Err(CodecError::Malformed);
        }
        let sign: [u8; 32] = bytes[4..36].try_into().map_err(|_| CodecError::Malformed)?;
        let enc: [u8; 32] = bytes[36..68].try_into().map_err(|_| CodecError::Malformed)?;
        let sign_pub = VerifyingKey::from_bytes(&sign).map_err(|_| CodecError::Malformed)?;
        Ok(Self { sign_pub, enc_pub: X25519Public::from(enc) })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RING_LEN);
        out.extend_from_slice(PUBLIC_RING_MAGIC);
        out.extend_from_slice(self.sign_pub.as_bytes());
        out.extend_from_slice(self.enc_pub.as_bytes());
        out
    }

    /// The canonical 40-hex-uppercase fingerprint: SHA-256 of the primary
    /// public key, truncated to 20 bytes.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.sign_pub.as_bytes());
        hex::encode_upper(&digest[..20])
    }

    /// Short id used to match sealed-envelope key stanzas to recipients.
    pub fn key_id(&self) -> [u8; 8] {
        let digest = Sha256::digest(self.enc_pub.as_bytes());
        digest[..8].try_into().expect("digest is long enough")
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CodecError> {
        self.sign_pub.verify(message, signature).map_err(|_| CodecError::BadSignature)
    }

    pub fn encryption_key(&self) -> &X25519Public {
        &self.enc_pub
    }
}

/// The full keyring including secret halves.
pub struct Keyring {
    signing: SigningKey,
    encryption: StaticSecret,
}

impl Keyring {
    /// Generate a fresh keyring from OS randomness.
    pub fn generate() -> Self {
        let signing = SigningKey::generate(&mut OsRng);
        let encryption = StaticSecret::random_from_rng(OsRng);
        Self { signing, encryption }
    }

    /// Reconstruct a keyring from an unsealed secret ring.
    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() != RING_LEN || &bytes[..4] != SECRET_RING_MAGIC {
            return Err(CodecError::Malformed);
        }
        let sign: [u8; 32] = bytes[4..36].try_into().map_err(|_| CodecError::Malformed)?;
        let enc: [u8; 32] = bytes[36..68].try_into().map_err(|_| CodecError::Malformed)?;
        Ok(Self { signing: SigningKey::from_bytes(&sign), encryption: StaticSecret::from(enc) })
    }

    /// Serialize the secret ring. The buffer zeroizes on drop; seal it with
    /// the device KEK before persisting.
    pub fn secret_bytes(&self) -> Zeroizing<Vec<u8>> {
        let mut out = Vec::with_capacity(RING_LEN);
        out.extend_from_slice(SECRET_RING_MAGIC);
        out.extend_from_slice(&self.signing.to_bytes());
        out.extend_from_slice(&self.encryption.to_bytes());
        Zeroizing::new(out)
    }

    pub fn public_ring(&self) -> PublicRing {
        PublicRing {
            sign_pub: self.signing.verifying_key(),
            enc_pub: X25519Public::from(&self.encryption),
        }
    }

    pub fn fingerprint(&self) -> String {
        self.public_ring().fingerprint()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }

    pub(crate) fn encryption_secret(&self) -> &StaticSecret {
        &self.encryption
    }

    /// Open a KEK-sealed secret ring and reconstruct the keyring. The
    /// unsealed bytes are wiped as soon as the keys are rebuilt.
    pub fn unseal(kek: &crate::DeviceKek, sealed: &str) -> Result<Self, CodecError> {
        let plain = kek.open(sealed).map_err(|_| CodecError::Malformed)?;
        Self::from_secret_bytes(&plain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_canonical() {
        let ring = Keyring::generate().public_ring();
        let fp = ring.fingerprint();
        assert_eq!(fp.len(), 40);
        assert!(fp.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_lowercase()));
    }

    #[test]
    fn public_ring_round_trip() {
        let keyring = Keyring::generate();
        let ring = keyring.public_ring();
        let bytes = ring.to_bytes();
        let back = PublicRing::from_bytes(&bytes).unwrap();
        assert_eq!(back, ring);
        assert_eq!(back.fingerprint(), ring.fingerprint());
    }

    #[test]
    fn secret_ring_round_trip() {
        let keyring = Keyring::generate();
        let secret = keyring.secret_bytes();
        let back = Keyring::from_secret_bytes(&secret).unwrap();
        assert_eq!(back.fingerprint(), keyring.fingerprint());

        let msg = b"stable identity";
        let sig = keyring.sign(msg);
        back.public_ring().verify(msg, &sig).unwrap();
    }

    #[test]
    fn rings_reject_wrong_magic() {
        let mut bytes = Keyring::generate().public_ring().to_bytes();
        bytes[0] = b'X';
        assert!(PublicRing::from_bytes(&bytes).is_err());
        assert!(Keyring::from_secret_bytes(&bytes).is_err());
        assert!(PublicRing::from_bytes(&bytes[..10]).is_err());
    }
}
