//! The sealed-envelope codec.
//!
//! The pipelines never touch primitives directly; they hand plaintext and
//! key material to an [`EnvelopeCodec`] and get sealed bytes back (or the
//! reverse). The default implementation is sign-then-encrypt:
//!
//! 1. The sender signs the plaintext with the Ed25519 primary.
//! 2. `signature(64) || plaintext` is encrypted under a fresh random message
//!    key with ChaCha20-Poly1305.
//! 3. The message key is wrapped once per recipient: an ephemeral X25519
//!    exchange against the recipient's encryption subkey, HKDF-SHA256 to a
//!    wrap key, ChaCha20-Poly1305 around the message key.
//!
//! A stanza is matched to a recipient by an 8-byte key id (SHA-256 of the
//! encryption subkey). The sender always wraps to itself as well, so its own
//! outgoing messages stay readable from the store.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use ed25519_dalek::Signature;
use hkdf::Hkdf;
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::EphemeralSecret;
use zeroize::Zeroizing;

use crate::keyring::{Keyring, PublicRing};
use crate::random_array;

const HKDF_INFO: &[u8] = b"echomesh.envelope.v1";
const SIGNATURE_LEN: usize = 64;

/// Codec failures, kept coarse so rejection codes stay stable.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CodecError {
    /// The payload decrypted but the signature did not verify against the
    /// claimed sender.
    #[error("signature verification failed")]
    BadSignature,
    /// No key stanza in the payload addresses this device.
    #[error("no matching recipient key")]
    NoMatchingRecipient,
    /// Structural or cryptographic decode failure.
    #[error("malformed sealed payload")]
    Malformed,
    /// Sealing failed (should not happen with healthy randomness).
    #[error("sealing failed")]
    EncryptFailed,
}

/// The abstract sealed-envelope interface consumed by the pipelines.
pub trait EnvelopeCodec: Send + Sync {
    /// Sign `plaintext` as `signer` and seal it to every ring in
    /// `recipients`.
    fn encrypt_and_sign(
        &self,
        plaintext: &[u8],
        recipients: &[&PublicRing],
        signer: &Keyring,
    ) -> Result<Vec<u8>, CodecError>;

    /// Unseal `sealed` with `own` and verify the embedded signature against
    /// `sender`. The returned buffer zeroizes on drop.
    fn decrypt_and_verify(
        &self,
        sealed: &[u8],
        sender: &PublicRing,
        own: &Keyring,
    ) -> Result<Zeroizing<Vec<u8>>, CodecError>;
}

/// One wrapped copy of the message key.
#[derive(Debug, Serialize, Deserialize)]
struct Stanza {
    /// Base64 8-byte recipient key id.
    kid: String,
    /// Base64 ephemeral X25519 public key.
    epk: String,
    /// Base64 12-byte wrap nonce.
    n: String,
    /// Base64 wrapped message key.
    ct: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct SealedPayload {
    v: u8,
    stanzas: Vec<Stanza>,
    /// Base64 12-byte body nonce.
    n: String,
    /// Base64 `signature || plaintext` ciphertext.
    ct: String,
}

/// Default codec implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct SealedEnvelopeCodec;

impl SealedEnvelopeCodec {
    fn wrap_key(
        message_key: &[u8; 32],
        recipient: &PublicRing,
    ) -> Result<Stanza, CodecError> {
        let eph = EphemeralSecret::random_from_rng(OsRng);
        let eph_pub = x25519_dalek::PublicKey::from(&eph);
        let shared = eph.diffie_hellman(recipient.encryption_key());

        let wrap_key = derive_wrap_key(
            shared.as_bytes(),
            eph_pub.as_bytes(),
            recipient.encryption_key().as_bytes(),
        );
        let nonce = random_array::<12>();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(wrap_key.as_ref()));
        let wrapped = cipher
            .encrypt(Nonce::from_slice(&nonce), message_key.as_slice())
            .map_err(|_| CodecError::EncryptFailed)?;

        Ok(Stanza {
            kid: B64.encode(recipient.key_id()),
            epk: B64.encode(eph_pub.as_bytes()),
            n: B64.encode(nonce),
            ct: B64.encode(wrapped),
        })
    }

    fn unwrap_key(stanza: &Stanza, own: &Keyring) -> Result<Zeroizing<[u8; 32]>, CodecError> {
        let eph_bytes: [u8; 32] = B64
            .decode(&stanza.epk)
            .ok()
            .and_then(|v| v.try_into().ok())
            .ok_or(CodecError::Malformed)?;
        let nonce = B64.decode(&stanza.n).map_err(|_| CodecError::Malformed)?;
        if nonce.len() != 12 {
            return Err(CodecError::Malformed);
        }
        let wrapped = B64.decode(&stanza.ct).map_err(|_| CodecError::Malformed)?;

        let eph_pub = x25519_dalek::PublicKey::from(eph_bytes);
        let shared = own.encryption_secret().diffie_hellman(&eph_pub);
        let own_pub = own.public_ring();
        let wrap_key = derive_wrap_key(
            shared.as_bytes(),
            eph_pub.as_bytes(),
            own_pub.encryption_key().as_bytes(),
        );

        let cipher = ChaCha20Poly1305::new(Key::from_slice(wrap_key.as_ref()));
        let mk = cipher
            .decrypt(Nonce::from_slice(&nonce), wrapped.as_slice())
            .map_err(|_| CodecError::Malformed)?;
        let mk: [u8; 32] = mk.try_into().map_err(|_| CodecError::Malformed)?;
        Ok(Zeroizing::new(mk))
    }
}

impl EnvelopeCodec for SealedEnvelopeCodec {
    fn encrypt_and_sign(
        &self,
        plaintext: &[u8],
        recipients: &[&PublicRing],
        signer: &Keyring,
    ) -> Result<Vec<u8>, CodecError> {
        if recipients.is_empty() {
            return Err(CodecError::EncryptFailed);
        }

        let signature = signer.sign(plaintext);
        let mut body = Zeroizing::new(Vec::with_capacity(SIGNATURE_LEN + plaintext.len()));
        body.extend_from_slice(&signature.to_bytes());
        body.extend_from_slice(plaintext);

        let message_key = Zeroizing::new(random_array::<32>());
        let body_nonce = random_array::<12>();
        let cipher = ChaCha20Poly1305::new(Key::from_slice(message_key.as_ref()));
        let ct = cipher
            .encrypt(Nonce::from_slice(&body_nonce), body.as_slice())
            .map_err(|_| CodecError::EncryptFailed)?;

        let mut stanzas = Vec::with_capacity(recipients.len());
        for recipient in recipients {
            stanzas.push(Self::wrap_key(&message_key, recipient)?);
        }

        let payload = SealedPayload {
            v: 1,
            stanzas,
            n: B64.encode(body_nonce),
            ct: B64.encode(ct),
        };
        serde_json::to_vec(&payload).map_err(|_| CodecError::EncryptFailed)
    }

    fn decrypt_and_verify(
        &self,
        sealed: &[u8],
        sender: &PublicRing,
        own: &Keyring,
    ) -> Result<Zeroizing<Vec<u8>>, CodecError> {
        let payload: SealedPayload =
            serde_json::from_slice(sealed).map_err(|_| CodecError::Malformed)?;
        if payload.v != 1 {
            return Err(CodecError::Malformed);
        }

        let own_kid = B64.encode(own.public_ring().key_id());
        let stanza = payload
            .stanzas
            .iter()
            .find(|s| s.kid == own_kid)
            .ok_or(CodecError::NoMatchingRecipient)?;
        let message_key = Self::unwrap_key(stanza, own)?;

        let body_nonce = B64.decode(&payload.n).map_err(|_| CodecError::Malformed)?;
        if body_nonce.len() != 12 {
            return Err(CodecError::Malformed);
        }
        let ct = B64.decode(&payload.ct).map_err(|_| CodecError::Malformed)?;

        let cipher = ChaCha20Poly1305::new(Key::from_slice(message_key.as_ref()));
        let body = Zeroizing::new(
            cipher
                .decrypt(Nonce::from_slice(&body_nonce), ct.as_slice())
                .map_err(|_| CodecError::Malformed)?,
        );
        if body.len() < SIGNATURE_LEN {
            return Err(CodecError::Malformed);
        }

        let sig_bytes: [u8; SIGNATURE_LEN] =
            body[..SIGNATURE_LEN].try_into().map_err(|_| CodecError::Malformed)?;
        let signature = Signature::from_bytes(&sig_bytes);
        let plaintext = &body[SIGNATURE_LEN..];
        sender.verify(plaintext, &signature)?;

        Ok(Zeroizing::new(plaintext.to_vec()))
    }
}

fn derive_wrap_key(shared: &[u8], eph_pub: &[u8], recip_pub: &[u8]) -> Zeroizing<[u8; 32]> {
    let mut salt = Vec::with_capacity(64);
    salt.extend_from_slice(eph_pub);
    salt.extend_from_slice(recip_pub);
    let hk = Hkdf::<Sha256>::new(Some(&salt), shared);
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(HKDF_INFO, okm.as_mut()).expect("32 bytes is a valid hkdf length");
    okm
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open() {
        let alice = Keyring::generate();
        let bob = Keyring::generate();
        let codec = SealedEnvelopeCodec;

        let sealed = codec
            .encrypt_and_sign(b"hello bob", &[&bob.public_ring()], &alice)
            .unwrap();
        let opened = codec
            .decrypt_and_verify(&sealed, &alice.public_ring(), &bob)
            .unwrap();
        assert_eq!(opened.as_slice(), b"hello bob");
    }

    #[test]
    fn sender_copy_stays_readable() {
        let alice = Keyring::generate();
        let bob = Keyring::generate();
        let codec = SealedEnvelopeCodec;

        let sealed = codec
            .encrypt_and_sign(
                b"note",
                &[&bob.public_ring(), &alice.public_ring()],
                &alice,
            )
            .unwrap();
        let opened = codec
            .decrypt_and_verify(&sealed, &alice.public_ring(), &alice)
            .unwrap();
        assert_eq!(opened.as_slice(), b"note");
    }

    #[test]
    fn wrong_sender_is_bad_signature() {
        let alice = Keyring::generate();
        let bob = Keyring::generate();
        let mallory = Keyring::generate();
        let codec = SealedEnvelopeCodec;

        let sealed = codec
            .encrypt_and_sign(b"hello", &[&bob.public_ring()], &alice)
            .unwrap();
        let err = codec
            .decrypt_and_verify(&sealed, &mallory.public_ring(), &bob)
            .unwrap_err();
        assert_eq!(err, CodecError::BadSignature);
    }

    #[test]
    fn unaddressed_device_is_no_matching_recipient() {
        let alice = Keyring::generate();
        let bob = Keyring::generate();
        let eve = Keyring::generate();
        let codec = SealedEnvelopeCodec;

        let sealed = codec
            .encrypt_and_sign(b"hello", &[&bob.public_ring()], &alice)
            .unwrap();
        let err = codec
            .decrypt_and_verify(&sealed, &alice.public_ring(), &eve)
            .unwrap_err();
        assert_eq!(err, CodecError::NoMatchingRecipient);
    }

    #[test]
    fn garbage_is_malformed() {
        let bob = Keyring::generate();
        let codec = SealedEnvelopeCodec;
        let err = codec
            .decrypt_and_verify(b"not json", &bob.public_ring(), &bob)
            .unwrap_err();
        assert_eq!(err, CodecError::Malformed);
    }

    #[test]
    fn tampered_body_fails_closed() {
        let alice = Keyring::generate();
        let bob = Keyring::generate();
        let codec = SealedEnvelopeCodec;

        let sealed = codec
            .encrypt_and_sign(b"hello", &[&bob.public_ring()], &alice)
            .unwrap();
        let mut payload: SealedPayload = serde_json::from_slice(&sealed).unwrap();
        let mut ct = B64.decode(&payload.ct).unwrap();
        ct[70] ^= 0x01;
        payload.ct = B64.encode(ct);
        let tampered = serde_json::to_vec(&payload).unwrap();

        let err = codec
            .decrypt_and_verify(&tampered, &alice.public_ring(), &bob)
            .unwrap_err();
        assert_eq!(err, CodecError::Malformed);
    }
}
