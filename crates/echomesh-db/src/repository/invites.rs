//! Invite repository.
//!
//! Consumption is a conditional update: only the first caller flips
//! `used_at`, so at-most-once redemption holds even under concurrent
//! requests.

use echomesh_common::models::Invite;

use crate::{Store, StoreError};

#[derive(sqlx::FromRow)]
struct InviteRow {
    token: String,
    created_at: i64,
    expires_at: i64,
    used_at: Option<i64>,
    consumer_hint: Option<String>,
}

impl From<InviteRow> for Invite {
    fn from(row: InviteRow) -> Self {
        Invite {
            token: row.token,
            created_at: row.created_at,
            expires_at: row.expires_at,
            used_at: row.used_at,
            consumer_hint: row.consumer_hint,
        }
    }
}

pub async fn insert(store: &Store, invite: &Invite) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO invites (token, created_at, expires_at, used_at, consumer_hint)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&invite.token)
    .bind(invite.created_at)
    .bind(invite.expires_at)
    .bind(invite.used_at)
    .bind(&invite.consumer_hint)
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn find(store: &Store, token: &str) -> Result<Option<Invite>, StoreError> {
    let row = sqlx::query_as::<_, InviteRow>("SELECT * FROM invites WHERE token = ?")
        .bind(token)
        .fetch_optional(store.pool())
        .await?;
    Ok(row.map(Invite::from))
}

/// Consume the invite if and only if it exists, is unused, and is not
/// expired. Returns `true` exactly once per token.
pub async fn mark_used_if_valid(store: &Store, token: &str, now: i64) -> Result<bool, StoreError> {
    let result = sqlx::query(
        r#"
        UPDATE invites
        SET used_at = ?
        WHERE token = ? AND used_at IS NULL AND expires_at > ?
        "#,
    )
    .bind(now)
    .bind(token)
    .bind(now)
    .execute(store.pool())
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Delete expired and used invites. Returns the number of rows removed.
pub async fn purge_dead(store: &Store, now: i64) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM invites WHERE used_at IS NOT NULL OR expires_at <= ?")
        .bind(now)
        .execute(store.pool())
        .await?;
    Ok(result.rows_affected())
}

/// Number of invites that are still redeemable.
pub async fn count_live(store: &Store, now: i64) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM invites WHERE used_at IS NULL AND expires_at > ?",
    )
    .bind(now)
    .fetch_one(store.pool())
    .await?;
    Ok(count)
}
