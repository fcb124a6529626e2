//! The contact manager service.
//!
//! Thin orchestration over the repository's trust rules, plus the import
//! entry points. A contact can arrive four ways — QR card, manual entry,
//! the ingress import endpoint, or an invite acceptance — and every path
//! funnels through [`ContactDraft::validate`] and the merge-safe upsert, so
//! canonicalization and trust handling cannot drift between them.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use echomesh_common::error::CoreError;
use echomesh_common::models::{Contact, ContactDraft, UpsertOutcome};
use echomesh_common::now_millis;
use echomesh_common::qr;
use echomesh_common::types::Fingerprint;
use echomesh_common::wire::InviteAccept;
use echomesh_db::repository::{contacts, identities};
use echomesh_db::Store;

#[derive(Clone)]
pub struct ContactManager {
    store: Store,
}

impl ContactManager {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    async fn self_fingerprint(&self) -> Result<Option<Fingerprint>, CoreError> {
        Ok(identities::find_active(&self.store)
            .await
            .map_err(internal)?
            .map(|i| i.fingerprint))
    }

    /// Import from a scanned `ec1|…` contact card.
    pub async fn import_qr(&self, card: &str) -> Result<UpsertOutcome, CoreError> {
        let decoded = qr::decode_contact(card)
            .ok_or(CoreError::BadRequest { message: "unreadable contact card".into() })?;
        let self_fp = self.self_fingerprint().await?;
        let draft = ContactDraft::validate(
            &decoded.fingerprint,
            decoded.onion.as_deref(),
            decoded.public_ring,
            None,
            self_fp.as_ref(),
        )?;
        self.upsert(&draft).await
    }

    /// Import from manually entered fields.
    pub async fn import_manual(
        &self,
        fingerprint: &str,
        onion: Option<&str>,
        pub_b64: &str,
        display_name: Option<&str>,
    ) -> Result<UpsertOutcome, CoreError> {
        let public_ring = B64
            .decode(pub_b64.trim())
            .map_err(|_| CoreError::BadRequest { message: "public key is not base64".into() })?;
        let self_fp = self.self_fingerprint().await?;
        let draft = ContactDraft::validate(fingerprint, onion, public_ring, None, self_fp.as_ref())?;
        let outcome = self.upsert(&draft).await?;
        if let Some(name) = display_name {
            contacts::set_display_name(&self.store, &draft.fingerprint, Some(name))
                .await
                .map_err(internal)?;
        }
        Ok(outcome)
    }

    /// Import the peer returned by a redeemed invite.
    pub async fn import_invite_accept(
        &self,
        accept: &InviteAccept,
    ) -> Result<(Fingerprint, UpsertOutcome), CoreError> {
        let public_ring = B64
            .decode(accept.pub_b64.trim())
            .map_err(|_| CoreError::BadRequest { message: "invite key is not base64".into() })?;
        let self_fp = self.self_fingerprint().await?;
        let draft = ContactDraft::validate(
            &accept.fingerprint,
            Some(&accept.primary_onion),
            public_ring,
            None,
            self_fp.as_ref(),
        )?;
        let outcome = self.upsert(&draft).await?;
        Ok((draft.fingerprint, outcome))
    }

    async fn upsert(&self, draft: &ContactDraft) -> Result<UpsertOutcome, CoreError> {
        contacts::upsert_merge_safe(&self.store, draft, now_millis())
            .await
            .map_err(internal)
    }

    pub async fn get(&self, fingerprint: &Fingerprint) -> Result<Option<Contact>, CoreError> {
        contacts::find(&self.store, fingerprint).await.map_err(internal)
    }

    pub async fn list(&self) -> Result<Vec<Contact>, CoreError> {
        contacts::list(&self.store).await.map_err(internal)
    }

    pub async fn approve_pending(&self, fingerprint: &Fingerprint) -> Result<(), CoreError> {
        contacts::approve_pending(&self.store, fingerprint).await.map_err(internal)
    }

    pub async fn reject_pending(&self, fingerprint: &Fingerprint) -> Result<(), CoreError> {
        contacts::reject_pending(&self.store, fingerprint).await.map_err(internal)
    }

    pub async fn mark_verified(&self, fingerprint: &Fingerprint) -> Result<(), CoreError> {
        contacts::mark_verified(&self.store, fingerprint).await.map_err(internal)
    }

    pub async fn mark_unverified(&self, fingerprint: &Fingerprint) -> Result<(), CoreError> {
        contacts::mark_unverified(&self.store, fingerprint).await.map_err(internal)
    }
}

fn internal(e: echomesh_db::StoreError) -> CoreError {
    CoreError::Internal(anyhow::Error::from(e))
}
