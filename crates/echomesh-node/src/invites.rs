//! Invite lifecycle: creation, remote acceptance, garbage collection.
//!
//! Creating an invite mints a URL-safe token, persists it with the fixed
//! TTL, and makes sure the ephemeral invite hidden service is up. The
//! `ec2|<onion>|<token>` descriptor is what the user hands to the peer.
//! Accepting a peer's descriptor runs the reverse: fetch the acceptance
//! document over SOCKS and import the contact through the common path.

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use echomesh_common::error::CoreError;
use echomesh_common::models::invite::INVITE_TTL_MS;
use echomesh_common::models::{Invite, UpsertOutcome};
use echomesh_common::now_millis;
use echomesh_common::qr;
use echomesh_common::types::Fingerprint;
use echomesh_common::wire::InviteAccept;
use echomesh_db::repository::invites;
use echomesh_db::Store;
use echomesh_tor::TorOrchestrator;

use crate::contacts::ContactManager;

/// Token entropy in bytes; 32 bytes encode to 43 URL-safe characters.
const TOKEN_LEN: usize = 32;

#[derive(Clone)]
pub struct InviteService {
    store: Store,
    tor: Arc<TorOrchestrator>,
    contacts: ContactManager,
}

impl InviteService {
    pub fn new(store: Store, tor: Arc<TorOrchestrator>, contacts: ContactManager) -> Self {
        Self { store, tor, contacts }
    }

    /// Mint a one-shot invite and return its `ec2|<onion>|<token>`
    /// descriptor. Ensures the ephemeral invite hidden service is
    /// published first, so the descriptor is immediately redeemable.
    pub async fn create_invite(
        &self,
        ingress_port: u16,
        virtual_port: u16,
    ) -> Result<String, CoreError> {
        let onion = self
            .tor
            .ensure_invite_hidden_service(ingress_port, virtual_port)
            .await
            .map_err(|e| CoreError::Internal(anyhow::Error::from(e)))?;

        let token = URL_SAFE_NO_PAD.encode(echomesh_crypto::random_array::<TOKEN_LEN>());
        let now = now_millis();
        invites::insert(
            &self.store,
            &Invite {
                token: token.clone(),
                created_at: now,
                expires_at: now + INVITE_TTL_MS,
                used_at: None,
                consumer_hint: None,
            },
        )
        .await
        .map_err(internal)?;
        tracing::info!("minted invite (expires in {}s)", INVITE_TTL_MS / 1000);

        Ok(qr::encode_invite(&onion, &token))
    }

    /// Redeem a peer's invite descriptor over SOCKS and import the returned
    /// contact draft.
    pub async fn accept_remote(
        &self,
        descriptor: &str,
    ) -> Result<(Fingerprint, UpsertOutcome), CoreError> {
        let (onion, token) = qr::decode_invite(descriptor)
            .ok_or(CoreError::BadRequest { message: "unreadable invite descriptor".into() })?;

        let (socks_host, socks_port) = self
            .tor
            .state()
            .socks_endpoint()
            .ok_or(CoreError::BadRequest { message: "transport is not ready".into() })?;

        let proxy = reqwest::Proxy::all(format!("socks5h://{socks_host}:{socks_port}"))
            .map_err(|e| CoreError::Internal(e.into()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CoreError::Internal(e.into()))?;

        let url = format!("http://{}/invite/{}", onion.as_str(), token);
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| CoreError::BadRequest { message: format!("invite fetch failed: {e}") })?;

        match response.status().as_u16() {
            200 => {}
            404 => return Err(CoreError::InviteNotFound),
            409 => return Err(CoreError::InviteUsed),
            410 => return Err(CoreError::InviteExpired),
            code => {
                return Err(CoreError::BadRequest {
                    message: format!("invite endpoint returned {code}"),
                })
            }
        }

        let accept: InviteAccept = response
            .json()
            .await
            .map_err(|_| CoreError::PlaintextJsonInvalid)?;
        if accept.v != 2 || !accept.ok || accept.protocol != "ec2" {
            return Err(CoreError::BadRequest { message: "unexpected acceptance document".into() });
        }

        self.contacts.import_invite_accept(&accept).await
    }

    /// Purge dead invites; drop the ephemeral service once nothing live
    /// remains.
    pub async fn gc(&self) -> Result<(), CoreError> {
        let now = now_millis();
        let removed = invites::purge_dead(&self.store, now).await.map_err(internal)?;
        if removed > 0 {
            tracing::debug!("purged {removed} dead invites");
        }
        if invites::count_live(&self.store, now).await.map_err(internal)? == 0 {
            self.tor.drop_invite_hidden_service().await;
        }
        Ok(())
    }
}

fn internal(e: echomesh_db::StoreError) -> CoreError {
    CoreError::Internal(anyhow::Error::from(e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use echomesh_common::validation::validate_token;

    #[test]
    fn minted_tokens_match_the_accepted_shape() {
        for _ in 0..16 {
            let token = URL_SAFE_NO_PAD.encode(echomesh_crypto::random_array::<TOKEN_LEN>());
            assert_eq!(token.len(), 43);
            validate_token(&token).expect("minted token must be redeemable");
        }
    }
}
