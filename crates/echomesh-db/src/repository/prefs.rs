//! Preference key-value repository.

use crate::{Store, StoreError};

/// Keep the Tor transport running while the app is backgrounded.
pub const KEY_KEEP_TRANSPORT: &str = "keep_transport_in_background";
/// Last onion this device published, cached for display across restarts.
pub const KEY_LAST_ONION: &str = "last_onion";

pub async fn get(store: &Store, key: &str) -> Result<Option<String>, StoreError> {
    let value: Option<String> = sqlx::query_scalar("SELECT value FROM prefs WHERE key = ?")
        .bind(key)
        .fetch_optional(store.pool())
        .await?;
    Ok(value)
}

pub async fn set(store: &Store, key: &str, value: &str) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO prefs (key, value) VALUES (?, ?)
        ON CONFLICT (key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(value)
    .execute(store.pool())
    .await?;
    Ok(())
}

pub async fn remove(store: &Store, key: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM prefs WHERE key = ?")
        .bind(key)
        .execute(store.pool())
        .await?;
    Ok(())
}
