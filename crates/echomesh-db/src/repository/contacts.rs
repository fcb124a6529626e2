//! Contact repository — TOFU insert, merge-safe upsert, pinning transitions.
//!
//! The trust rules live here, next to the rows they protect:
//!
//! * Unknown fingerprint → insert as `Unverified` (trust-on-first-use).
//! * Known and `Unverified` → divergent fields refresh in place.
//! * Known and `Verified` → pinned fields never change; divergence is
//!   parked in the pending slots until the user approves or rejects it.

use echomesh_common::models::{ChangeState, Contact, ContactDraft, TrustLevel, UpsertOutcome};
use echomesh_common::types::{Fingerprint, OnionAddr};

use crate::{Store, StoreError};

#[derive(sqlx::FromRow)]
struct ContactRow {
    fingerprint: String,
    onion: Option<String>,
    public_ring: Vec<u8>,
    display_name: Option<String>,
    trust: i64,
    change_state: i64,
    pending_onion: Option<String>,
    pending_public_ring: Option<Vec<u8>>,
    created_at: i64,
}

impl ContactRow {
    fn into_contact(self, store: &Store) -> Result<Contact, StoreError> {
        let parse_onion = |raw: Option<String>, what: &str| -> Result<Option<OnionAddr>, StoreError> {
            raw.map(|o| OnionAddr::parse(&o).map_err(|_| StoreError::Corrupt(what.into())))
                .transpose()
        };
        let display_name = self
            .display_name
            .map(|sealed| store.master().open_str(&sealed))
            .transpose()?;
        Ok(Contact {
            fingerprint: Fingerprint::parse(&self.fingerprint)
                .map_err(|_| StoreError::Corrupt("contact fingerprint".into()))?,
            onion: parse_onion(self.onion, "contact onion")?,
            public_ring: self.public_ring,
            display_name,
            trust: TrustLevel::from_i64(self.trust),
            change_state: ChangeState::from_i64(self.change_state),
            pending_onion: parse_onion(self.pending_onion, "contact pending onion")?,
            pending_public_ring: self.pending_public_ring,
            created_at: self.created_at,
        })
    }
}

/// Fetch one contact by fingerprint.
pub async fn find(store: &Store, fingerprint: &Fingerprint) -> Result<Option<Contact>, StoreError> {
    let row = sqlx::query_as::<_, ContactRow>("SELECT * FROM contacts WHERE fingerprint = ?")
        .bind(fingerprint.as_str())
        .fetch_optional(store.pool())
        .await?;
    row.map(|r| r.into_contact(store)).transpose()
}

/// All contacts, newest first.
pub async fn list(store: &Store) -> Result<Vec<Contact>, StoreError> {
    let rows = sqlx::query_as::<_, ContactRow>(
        "SELECT * FROM contacts ORDER BY created_at DESC",
    )
    .fetch_all(store.pool())
    .await?;
    rows.into_iter().map(|r| r.into_contact(store)).collect()
}

/// Transactional merge-safe upsert: the single convergence point for every
/// contact observation, regardless of entry path.
///
/// An absent incoming onion is treated as "no observation", not as
/// divergence; cards produced before a peer's first publish carry no
/// address.
pub async fn upsert_merge_safe(
    store: &Store,
    draft: &ContactDraft,
    now: i64,
) -> Result<UpsertOutcome, StoreError> {
    let mut tx = store.pool().begin().await?;

    let existing = sqlx::query_as::<_, ContactRow>(
        "SELECT * FROM contacts WHERE fingerprint = ?",
    )
    .bind(draft.fingerprint.as_str())
    .fetch_optional(&mut *tx)
    .await?;

    let Some(existing) = existing else {
        sqlx::query(
            r#"
            INSERT INTO contacts
                (fingerprint, onion, public_ring, display_name, trust, change_state,
                 pending_onion, pending_public_ring, created_at)
            VALUES (?, ?, ?, NULL, ?, ?, NULL, NULL, ?)
            "#,
        )
        .bind(draft.fingerprint.as_str())
        .bind(draft.onion.as_ref().map(|o| o.as_str().to_owned()))
        .bind(&draft.public_ring)
        .bind(TrustLevel::Unverified.as_i64())
        .bind(ChangeState::None.as_i64())
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        return Ok(UpsertOutcome::Inserted);
    };

    let key_changed = draft.public_ring != existing.public_ring;
    let onion_changed = match &draft.onion {
        Some(incoming) => existing.onion.as_deref() != Some(incoming.as_str()),
        None => false,
    };

    if !key_changed && !onion_changed {
        tx.commit().await?;
        return Ok(UpsertOutcome::NoChange);
    }

    if TrustLevel::from_i64(existing.trust) != TrustLevel::Verified {
        // TOFU refresh: replace in place, clear any stale pending state.
        sqlx::query(
            r#"
            UPDATE contacts
            SET onion = COALESCE(?, onion),
                public_ring = ?,
                change_state = ?,
                pending_onion = NULL,
                pending_public_ring = NULL
            WHERE fingerprint = ?
            "#,
        )
        .bind(draft.onion.as_ref().map(|o| o.as_str().to_owned()))
        .bind(&draft.public_ring)
        .bind(ChangeState::None.as_i64())
        .bind(draft.fingerprint.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        return Ok(UpsertOutcome::UpdatedUnverified);
    }

    // Pinned: park the divergence, never touch the pinned columns.
    let change_state =
        ChangeState::from_i64(existing.change_state).compose(key_changed, onion_changed);
    sqlx::query(
        r#"
        UPDATE contacts
        SET pending_onion = CASE WHEN ? THEN ? ELSE pending_onion END,
            pending_public_ring = CASE WHEN ? THEN ? ELSE pending_public_ring END,
            change_state = ?
        WHERE fingerprint = ?
        "#,
    )
    .bind(onion_changed)
    .bind(draft.onion.as_ref().map(|o| o.as_str().to_owned()))
    .bind(key_changed)
    .bind(key_changed.then(|| draft.public_ring.clone()))
    .bind(change_state.as_i64())
    .bind(draft.fingerprint.as_str())
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    Ok(UpsertOutcome::PendingApproval { key_changed, onion_changed })
}

/// Promote pending fields to pinned, clearing the pending state. Trust is
/// preserved.
pub async fn approve_pending(store: &Store, fingerprint: &Fingerprint) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE contacts
        SET onion = COALESCE(pending_onion, onion),
            public_ring = COALESCE(pending_public_ring, public_ring),
            pending_onion = NULL,
            pending_public_ring = NULL,
            change_state = 0
        WHERE fingerprint = ?
        "#,
    )
    .bind(fingerprint.as_str())
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Discard pending fields, leaving the pinned values intact.
pub async fn reject_pending(store: &Store, fingerprint: &Fingerprint) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE contacts
        SET pending_onion = NULL,
            pending_public_ring = NULL,
            change_state = 0
        WHERE fingerprint = ?
        "#,
    )
    .bind(fingerprint.as_str())
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Explicit trust transition to `Verified` (pinning).
pub async fn mark_verified(store: &Store, fingerprint: &Fingerprint) -> Result<(), StoreError> {
    set_trust(store, fingerprint, TrustLevel::Verified).await
}

/// Explicit trust transition back to `Unverified`.
pub async fn mark_unverified(store: &Store, fingerprint: &Fingerprint) -> Result<(), StoreError> {
    set_trust(store, fingerprint, TrustLevel::Unverified).await
}

async fn set_trust(
    store: &Store,
    fingerprint: &Fingerprint,
    trust: TrustLevel,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE contacts SET trust = ? WHERE fingerprint = ?")
        .bind(trust.as_i64())
        .bind(fingerprint.as_str())
        .execute(store.pool())
        .await?;
    Ok(())
}

/// Apply an inbound onion rotation under the TOFU-or-pending rule,
/// composing with any pending key state.
///
/// Returns `true` when the update was applied or parked, `false` when the
/// sender is not a contact.
pub async fn apply_inbound_onion_update(
    store: &Store,
    sender: &Fingerprint,
    new_onion: &OnionAddr,
) -> Result<bool, StoreError> {
    let mut tx = store.pool().begin().await?;

    let existing = sqlx::query_as::<_, ContactRow>(
        "SELECT * FROM contacts WHERE fingerprint = ?",
    )
    .bind(sender.as_str())
    .fetch_optional(&mut *tx)
    .await?;
    let Some(existing) = existing else {
        tx.commit().await?;
        return Ok(false);
    };

    if existing.onion.as_deref() == Some(new_onion.as_str()) {
        tx.commit().await?;
        return Ok(true);
    }

    if TrustLevel::from_i64(existing.trust) != TrustLevel::Verified {
        sqlx::query("UPDATE contacts SET onion = ?, pending_onion = NULL WHERE fingerprint = ?")
            .bind(new_onion.as_str())
            .bind(sender.as_str())
            .execute(&mut *tx)
            .await?;
    } else {
        let change_state = ChangeState::from_i64(existing.change_state).compose(false, true);
        sqlx::query(
            "UPDATE contacts SET pending_onion = ?, change_state = ? WHERE fingerprint = ?",
        )
        .bind(new_onion.as_str())
        .bind(change_state.as_i64())
        .bind(sender.as_str())
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(true)
}

/// Set or clear the local display name. Sealed at rest; never transmitted.
pub async fn set_display_name(
    store: &Store,
    fingerprint: &Fingerprint,
    name: Option<&str>,
) -> Result<(), StoreError> {
    let sealed = name.map(|n| store.master().seal_str(n)).transpose()?;
    sqlx::query("UPDATE contacts SET display_name = ? WHERE fingerprint = ?")
        .bind(sealed)
        .bind(fingerprint.as_str())
        .execute(store.pool())
        .await?;
    Ok(())
}
