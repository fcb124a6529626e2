//! # echomesh-crypto
//!
//! The cryptographic boundary of the node:
//!
//! - **Keyring** — the device keypair: an Ed25519 signing primary and an
//!   X25519 encryption subkey, with a stable 40-hex fingerprint derived from
//!   the primary public key.
//! - **Sealed-envelope codec** — the abstract encrypt+sign / decrypt+verify
//!   interface the pipelines talk to, plus the default implementation.
//! - **Device-bound sealing** — the `"v1:"`-prefixed AES-256-GCM format used
//!   to protect secret material at rest (secret ring, hidden-service key,
//!   store master key).
//! - **PIN KDF** — optional memory-hard wrapping of the store master key.
//!
//! Secret material is held in [`zeroize::Zeroizing`] buffers and wiped on
//! every exit path. Nothing in this crate logs key bytes.

pub mod envelope;
pub mod keyring;
pub mod pin;
pub mod sealing;

pub use envelope::{CodecError, EnvelopeCodec, SealedEnvelopeCodec};
pub use keyring::{Keyring, PublicRing};
pub use sealing::DeviceKek;

use rand_core::{OsRng, RngCore};

/// Fill-and-return `n` bytes of OS randomness.
pub fn random_vec(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    OsRng.fill_bytes(&mut buf);
    buf
}

/// A fixed-size array of OS randomness.
pub fn random_array<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    OsRng.fill_bytes(&mut buf);
    buf
}
