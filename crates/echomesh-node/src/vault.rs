//! The identity vault.
//!
//! Creates the device keypair on first run, seals the secret ring under the
//! device KEK before it is persisted, and rebinds the published onion. The
//! vault never keeps an unsealed secret ring around: decryption happens on
//! demand at the crypto boundary and the plaintext is wiped after use.

use std::sync::Arc;

use echomesh_common::error::CoreError;
use echomesh_common::models::Identity;
use echomesh_common::now_millis;
use echomesh_common::types::{Fingerprint, OnionAddr};
use echomesh_crypto::{DeviceKek, Keyring};
use echomesh_db::repository::{identities, prefs};
use echomesh_db::Store;

#[derive(Clone)]
pub struct IdentityVault {
    store: Store,
    kek: Arc<DeviceKek>,
}

impl IdentityVault {
    pub fn new(store: Store, kek: Arc<DeviceKek>) -> Self {
        Self { store, kek }
    }

    /// Return the active identity, generating and persisting one on first
    /// run.
    pub async fn ensure_identity(&self) -> Result<Identity, CoreError> {
        if let Some(identity) = identities::find_active(&self.store).await.map_err(internal)? {
            return Ok(identity);
        }

        let keyring = Keyring::generate();
        let fingerprint = Fingerprint::parse(&keyring.fingerprint())
            .map_err(|_| CoreError::Internal(anyhow::anyhow!("generated fingerprint invalid")))?;
        let sealed_ring = {
            let secret = keyring.secret_bytes();
            self.kek
                .seal(&secret)
                .map_err(|e| CoreError::Internal(anyhow::Error::from(e)))?
        };

        let identity = Identity {
            fingerprint: fingerprint.clone(),
            onion: None,
            public_ring: keyring.public_ring().to_bytes(),
            sealed_secret_ring: sealed_ring.into_bytes(),
            active: true,
            created_at: now_millis(),
        };
        identities::insert(&self.store, &identity).await.map_err(internal)?;
        tracing::info!(fingerprint = %fingerprint, "generated device identity");
        Ok(identity)
    }

    /// Bind a freshly published onion to the identity. Idempotent: binding
    /// the current onion is a no-op. Rejects non-canonical input.
    pub async fn bind_onion(&self, onion: &str) -> Result<Identity, CoreError> {
        let onion = OnionAddr::parse(onion)?;
        let mut identity = identities::find_active(&self.store)
            .await
            .map_err(internal)?
            .ok_or(CoreError::LocalIdentityMissing)?;

        if identity.onion.as_ref() == Some(&onion) {
            return Ok(identity);
        }

        identities::bind_onion(&self.store, &identity.fingerprint, &onion)
            .await
            .map_err(internal)?;
        prefs::set(&self.store, prefs::KEY_LAST_ONION, onion.as_str())
            .await
            .map_err(internal)?;
        identity.onion = Some(onion);
        Ok(identity)
    }

    pub async fn has_valid_onion(&self) -> Result<bool, CoreError> {
        Ok(identities::find_active(&self.store)
            .await
            .map_err(internal)?
            .map(|i| i.has_valid_onion())
            .unwrap_or(false))
    }
}

fn internal(e: echomesh_db::StoreError) -> CoreError {
    CoreError::Internal(anyhow::Error::from(e))
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn vault() -> IdentityVault {
        let store = Store::open_in_memory().await.unwrap();
        IdentityVault::new(store, Arc::new(DeviceKek::from_bytes([1u8; 32])))
    }

    #[tokio::test]
    async fn ensure_identity_is_created_once() {
        let vault = vault().await;
        let first = vault.ensure_identity().await.unwrap();
        let second = vault.ensure_identity().await.unwrap();
        assert_eq!(first.fingerprint, second.fingerprint);
        assert!(!first.has_valid_onion());
        // the persisted secret ring is sealed, not raw key material
        assert!(first.sealed_secret_ring.starts_with(b"v1:"));
    }

    #[tokio::test]
    async fn sealed_ring_opens_back_into_the_same_keyring() {
        let vault = vault().await;
        let identity = vault.ensure_identity().await.unwrap();
        let sealed = std::str::from_utf8(&identity.sealed_secret_ring).unwrap();
        let keyring = Keyring::unseal(&vault.kek, sealed).unwrap();
        assert_eq!(keyring.fingerprint(), identity.fingerprint.as_str());
    }

    #[tokio::test]
    async fn bind_onion_is_idempotent_and_validates() {
        let vault = vault().await;
        vault.ensure_identity().await.unwrap();
        assert!(!vault.has_valid_onion().await.unwrap());

        let onion = format!("{}.onion", "c".repeat(56));
        let bound = vault.bind_onion(&onion).await.unwrap();
        assert_eq!(bound.onion.as_ref().unwrap().as_str(), onion);
        assert!(vault.has_valid_onion().await.unwrap());

        // same onion again: no-op
        let again = vault.bind_onion(&onion).await.unwrap();
        assert_eq!(again.onion.as_ref().unwrap().as_str(), onion);

        // replacement with a different valid onion
        let other = format!("{}.onion", "d".repeat(56));
        let replaced = vault.bind_onion(&other).await.unwrap();
        assert_eq!(replaced.onion.as_ref().unwrap().as_str(), other);

        assert!(matches!(
            vault.bind_onion("not-an-onion").await,
            Err(CoreError::InvalidOnion)
        ));
    }
}
