//! The store master key and its sealed on-disk form.
//!
//! Layout of `store_master.enc` (JSON):
//!
//! * without PIN: `{"v":1,"sealed":"v1:..."}` — the 32-byte master key
//!   sealed by the device KEK.
//! * with PIN: `{"v":1,"pin":{...kdf params...},"sealed":"v1:..."}` — the
//!   KEK-sealed string wrapped once more under the PIN-derived key, so
//!   opening requires both the device key and the PIN.

use std::fs;
use std::path::Path;

use echomesh_crypto::pin::{unwrap_master_key_str, wrap_master_key_str, PinKdfParams};
use echomesh_crypto::sealing::{open_with_key, seal_with_key};
use echomesh_crypto::DeviceKek;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::StoreError;

#[derive(Serialize, Deserialize)]
struct MasterKeyFile {
    v: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pin: Option<PinKdfParams>,
    sealed: String,
}

/// The unsealed 32-byte master key, held in memory for the life of the
/// store handle and wiped on drop.
pub struct MasterKey {
    key: Zeroizing<[u8; 32]>,
}

impl MasterKey {
    /// Load the master key from `path`, creating and sealing a fresh one on
    /// first run.
    pub fn load_or_create(
        path: &Path,
        kek: &DeviceKek,
        pin: Option<&str>,
    ) -> Result<Self, StoreError> {
        if path.exists() {
            let raw = fs::read_to_string(path)?;
            let file: MasterKeyFile = serde_json::from_str(&raw)
                .map_err(|e| StoreError::Corrupt(format!("master key file: {e}")))?;
            if file.v != 1 {
                return Err(StoreError::Corrupt("unknown master key file version".into()));
            }

            let kek_sealed = match (&file.pin, pin) {
                (Some(params), Some(pin)) => {
                    Zeroizing::new(unwrap_master_key_str(pin, params, &file.sealed)?)
                }
                (Some(_), None) => return Err(StoreError::PinRequired),
                (None, _) => Zeroizing::new(file.sealed.clone()),
            };

            let plain = kek.open(&kek_sealed)?;
            let key: [u8; 32] = plain
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Corrupt("master key has wrong length".into()))?;
            return Ok(Self { key: Zeroizing::new(key) });
        }

        let key = echomesh_crypto::random_array::<32>();
        let kek_sealed = kek.seal(&key)?;
        let file = match pin {
            Some(pin) => {
                let params = PinKdfParams::fresh();
                let sealed = wrap_master_key_str(pin, &params, &kek_sealed)?;
                MasterKeyFile { v: 1, pin: Some(params), sealed }
            }
            None => MasterKeyFile { v: 1, pin: None, sealed: kek_sealed },
        };

        let json = serde_json::to_string(&file)
            .map_err(|e| StoreError::Corrupt(format!("master key file: {e}")))?;
        fs::write(path, json)?;
        tracing::info!("Created sealed store master key");
        Ok(Self { key: Zeroizing::new(key) })
    }

    /// A throwaway master key for in-memory test stores.
    pub fn ephemeral() -> Self {
        Self { key: Zeroizing::new(echomesh_crypto::random_array::<32>()) }
    }

    /// Seal a UTF-8 string column value.
    pub fn seal_str(&self, plain: &str) -> Result<String, StoreError> {
        Ok(seal_with_key(&self.key, plain.as_bytes())?)
    }

    /// Open a sealed string column value.
    pub fn open_str(&self, sealed: &str) -> Result<String, StoreError> {
        let plain = open_with_key(&self.key, sealed)?;
        String::from_utf8(plain.to_vec())
            .map_err(|_| StoreError::Corrupt("sealed column is not utf-8".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!("em-master-{}-{name}", std::process::id()))
    }

    #[test]
    fn create_then_reload() {
        let path = temp_path("plain");
        let _ = fs::remove_file(&path);
        let kek = DeviceKek::from_bytes([1u8; 32]);

        let master = MasterKey::load_or_create(&path, &kek, None).unwrap();
        let sealed = master.seal_str("hello").unwrap();

        let reloaded = MasterKey::load_or_create(&path, &kek, None).unwrap();
        assert_eq!(reloaded.open_str(&sealed).unwrap(), "hello");
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn pin_wrapped_requires_pin() {
        let path = temp_path("pinned");
        let _ = fs::remove_file(&path);
        let kek = DeviceKek::from_bytes([2u8; 32]);

        let master = MasterKey::load_or_create(&path, &kek, Some("0000")).unwrap();
        let sealed = master.seal_str("secret").unwrap();

        assert!(matches!(
            MasterKey::load_or_create(&path, &kek, None),
            Err(StoreError::PinRequired)
        ));
        let reloaded = MasterKey::load_or_create(&path, &kek, Some("0000")).unwrap();
        assert_eq!(reloaded.open_str(&sealed).unwrap(), "secret");
        let _ = fs::remove_file(&path);
    }
}
