//! Identity repository.
//!
//! Exactly one active identity exists per device. Rows are immutable after
//! creation except for the onion column, which is rebound whenever the
//! hidden service is (re)published.

use echomesh_common::models::Identity;
use echomesh_common::types::{Fingerprint, OnionAddr};

use crate::{Store, StoreError};

#[derive(sqlx::FromRow)]
struct IdentityRow {
    fingerprint: String,
    onion: Option<String>,
    public_ring: Vec<u8>,
    sealed_secret_ring: String,
    active: i64,
    created_at: i64,
}

impl IdentityRow {
    fn into_identity(self) -> Result<Identity, StoreError> {
        let fingerprint = Fingerprint::parse(&self.fingerprint)
            .map_err(|_| StoreError::Corrupt("identity fingerprint".into()))?;
        let onion = match self.onion {
            Some(o) => Some(
                OnionAddr::parse(&o).map_err(|_| StoreError::Corrupt("identity onion".into()))?,
            ),
            None => None,
        };
        Ok(Identity {
            fingerprint,
            onion,
            public_ring: self.public_ring,
            sealed_secret_ring: self.sealed_secret_ring.into_bytes(),
            active: self.active == 1,
            created_at: self.created_at,
        })
    }
}

/// The single active identity, if one has been provisioned.
pub async fn find_active(store: &Store) -> Result<Option<Identity>, StoreError> {
    let row = sqlx::query_as::<_, IdentityRow>(
        "SELECT * FROM identities WHERE active = 1 LIMIT 1",
    )
    .fetch_optional(store.pool())
    .await?;
    row.map(IdentityRow::into_identity).transpose()
}

/// Insert a freshly generated identity.
pub async fn insert(store: &Store, identity: &Identity) -> Result<(), StoreError> {
    let sealed = String::from_utf8(identity.sealed_secret_ring.clone())
        .map_err(|_| StoreError::Corrupt("sealed secret ring is not utf-8".into()))?;
    sqlx::query(
        r#"
        INSERT INTO identities (fingerprint, onion, public_ring, sealed_secret_ring, active, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(identity.fingerprint.as_str())
    .bind(identity.onion.as_ref().map(|o| o.as_str().to_owned()))
    .bind(&identity.public_ring)
    .bind(sealed)
    .bind(if identity.active { 1i64 } else { 0i64 })
    .bind(identity.created_at)
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Rebind the published onion. Binding the same onion is a no-op.
pub async fn bind_onion(
    store: &Store,
    fingerprint: &Fingerprint,
    onion: &OnionAddr,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE identities SET onion = ? WHERE fingerprint = ?")
        .bind(onion.as_str())
        .bind(fingerprint.as_str())
        .execute(store.pool())
        .await?;
    Ok(())
}
