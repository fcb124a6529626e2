//! Optional PIN wrapping of the store master key.
//!
//! When the user sets a PIN, the master key is additionally wrapped by a key
//! derived with scrypt (N=2^15, r=8, p=1, dkLen=32). The parameters are
//! fixed; they are persisted alongside the wrapped key so a future
//! parameter bump can re-wrap on next unlock.

use scrypt::Params;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::sealing::{open_with_key, seal_with_key, SealError};

/// scrypt cost parameter, log2 form: N = 2^15.
pub const SCRYPT_LOG_N: u8 = 15;
pub const SCRYPT_R: u32 = 8;
pub const SCRYPT_P: u32 = 1;
pub const SCRYPT_DK_LEN: usize = 32;

/// Persisted KDF parameters for the PIN wrap.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PinKdfParams {
    pub log_n: u8,
    pub r: u32,
    pub p: u32,
    pub salt_b64: String,
}

impl PinKdfParams {
    pub fn fresh() -> Self {
        use base64::Engine as _;
        Self {
            log_n: SCRYPT_LOG_N,
            r: SCRYPT_R,
            p: SCRYPT_P,
            salt_b64: base64::engine::general_purpose::STANDARD.encode(crate::random_array::<16>()),
        }
    }

    fn salt(&self) -> Result<Vec<u8>, SealError> {
        use base64::Engine as _;
        base64::engine::general_purpose::STANDARD
            .decode(&self.salt_b64)
            .map_err(|_| SealError::Format)
    }
}

/// Derive the PIN wrap key.
pub fn derive_pin_key(pin: &str, params: &PinKdfParams) -> Result<Zeroizing<[u8; 32]>, SealError> {
    let scrypt_params = Params::new(params.log_n, params.r, params.p, SCRYPT_DK_LEN)
        .map_err(|_| SealError::Format)?;
    let salt = params.salt()?;
    let mut out = Zeroizing::new([0u8; 32]);
    scrypt::scrypt(pin.as_bytes(), &salt, &scrypt_params, out.as_mut())
        .map_err(|_| SealError::Crypto)?;
    Ok(out)
}

/// Wrap the master key under a PIN.
pub fn wrap_master_key(
    pin: &str,
    params: &PinKdfParams,
    master: &[u8; 32],
) -> Result<String, SealError> {
    let key = derive_pin_key(pin, params)?;
    seal_with_key(&key, master)
}

/// Unwrap a PIN-wrapped master key.
pub fn unwrap_master_key(
    pin: &str,
    params: &PinKdfParams,
    wrapped: &str,
) -> Result<Zeroizing<[u8; 32]>, SealError> {
    let key = derive_pin_key(pin, params)?;
    let plain = open_with_key(&key, wrapped)?;
    let master: [u8; 32] = plain.as_slice().try_into().map_err(|_| SealError::Format)?;
    Ok(Zeroizing::new(master))
}

/// Wrap an already-sealed string (e.g. a KEK-sealed master key) under a PIN.
pub fn wrap_master_key_str(
    pin: &str,
    params: &PinKdfParams,
    plain: &str,
) -> Result<String, SealError> {
    let key = derive_pin_key(pin, params)?;
    seal_with_key(&key, plain.as_bytes())
}

/// Reverse of [`wrap_master_key_str`].
pub fn unwrap_master_key_str(
    pin: &str,
    params: &PinKdfParams,
    wrapped: &str,
) -> Result<String, SealError> {
    let key = derive_pin_key(pin, params)?;
    let plain = open_with_key(&key, wrapped)?;
    String::from_utf8(plain.to_vec()).map_err(|_| SealError::Format)
}
