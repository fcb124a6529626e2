//! Message repository.
//!
//! Inserts are idempotent on the row id; conversation listings order by the
//! later of `server_received_at` and `created_at`. The blob column is sealed
//! under the store master key before it reaches the database file.

use echomesh_common::models::{Direction, Message, MessageStatus};
use echomesh_common::types::Fingerprint;

use crate::{Store, StoreError};

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    conv_id: String,
    direction: i64,
    sender_fp: String,
    recipient_fp: String,
    created_at: i64,
    server_received_at: i64,
    status: i64,
    attempts: i64,
    last_error: Option<String>,
    next_retry_at: i64,
    kind: String,
    blob: String,
}

impl MessageRow {
    fn into_message(self, store: &Store) -> Result<Message, StoreError> {
        let parse_fp = |raw: &str, what: &str| {
            Fingerprint::parse(raw).map_err(|_| StoreError::Corrupt(what.into()))
        };
        Ok(Message {
            id: self.id,
            conv_id: parse_fp(&self.conv_id, "message conv_id")?,
            direction: Direction::from_i64(self.direction),
            sender_fp: parse_fp(&self.sender_fp, "message sender_fp")?,
            recipient_fp: parse_fp(&self.recipient_fp, "message recipient_fp")?,
            created_at: self.created_at,
            server_received_at: self.server_received_at,
            status: MessageStatus::from_i64(self.status),
            attempts: self.attempts,
            last_error: self.last_error,
            next_retry_at: self.next_retry_at,
            kind: self.kind,
            blob: store.master().open_str(&self.blob)?,
        })
    }
}

/// Idempotent insert keyed by the row id. Returns `false` when a row with
/// the same id already existed (nothing is written in that case).
pub async fn insert(store: &Store, message: &Message) -> Result<bool, StoreError> {
    let sealed_blob = store.master().seal_str(&message.blob)?;
    let result = sqlx::query(
        r#"
        INSERT OR IGNORE INTO messages
            (id, conv_id, direction, sender_fp, recipient_fp, created_at,
             server_received_at, status, attempts, last_error, next_retry_at, kind, blob)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&message.id)
    .bind(message.conv_id.as_str())
    .bind(message.direction.as_i64())
    .bind(message.sender_fp.as_str())
    .bind(message.recipient_fp.as_str())
    .bind(message.created_at)
    .bind(message.server_received_at)
    .bind(message.status.as_i64())
    .bind(message.attempts)
    .bind(&message.last_error)
    .bind(message.next_retry_at)
    .bind(&message.kind)
    .bind(sealed_blob)
    .execute(store.pool())
    .await?;
    Ok(result.rows_affected() == 1)
}

/// Fetch one message by row id.
pub async fn find(store: &Store, id: &str) -> Result<Option<Message>, StoreError> {
    let row = sqlx::query_as::<_, MessageRow>("SELECT * FROM messages WHERE id = ?")
        .bind(id)
        .fetch_optional(store.pool())
        .await?;
    row.map(|r| r.into_message(store)).transpose()
}

/// List a conversation, newest first, ordered by the later of the server
/// receive time and the creation time.
pub async fn list_conversation(
    store: &Store,
    conv_id: &Fingerprint,
    limit: i64,
) -> Result<Vec<Message>, StoreError> {
    let limit = limit.clamp(1, 500);
    let rows = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT * FROM messages
        WHERE conv_id = ?
        ORDER BY MAX(server_received_at, created_at) DESC, id DESC
        LIMIT ?
        "#,
    )
    .bind(conv_id.as_str())
    .bind(limit)
    .fetch_all(store.pool())
    .await?;
    rows.into_iter().map(|r| r.into_message(store)).collect()
}

/// Transition a row to `SentOk`.
pub async fn mark_sent(store: &Store, id: &str) -> Result<(), StoreError> {
    sqlx::query("UPDATE messages SET status = ?, last_error = NULL WHERE id = ?")
        .bind(MessageStatus::SentOk.as_i64())
        .bind(id)
        .execute(store.pool())
        .await?;
    Ok(())
}

/// Transition a row to terminal `Failed` with an error code.
pub async fn mark_failed(store: &Store, id: &str, error_code: &str) -> Result<(), StoreError> {
    sqlx::query("UPDATE messages SET status = ?, last_error = ? WHERE id = ?")
        .bind(MessageStatus::Failed.as_i64())
        .bind(error_code)
        .bind(id)
        .execute(store.pool())
        .await?;
    Ok(())
}

/// Record a retryable delivery failure: keep `Queued`, bump the attempt
/// counter, note the error, and schedule the next sweep.
pub async fn mark_queued_retry(
    store: &Store,
    id: &str,
    error_code: &str,
    next_retry_at: i64,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE messages
        SET status = ?, attempts = attempts + 1, last_error = ?, next_retry_at = ?
        WHERE id = ?
        "#,
    )
    .bind(MessageStatus::Queued.as_i64())
    .bind(error_code)
    .bind(next_retry_at)
    .bind(id)
    .execute(store.pool())
    .await?;
    Ok(())
}

/// Outbound rows whose retry time has come.
pub async fn due_retries(store: &Store, now: i64, limit: i64) -> Result<Vec<Message>, StoreError> {
    let rows = sqlx::query_as::<_, MessageRow>(
        r#"
        SELECT * FROM messages
        WHERE status = ? AND direction = ? AND next_retry_at <= ?
        ORDER BY next_retry_at ASC
        LIMIT ?
        "#,
    )
    .bind(MessageStatus::Queued.as_i64())
    .bind(Direction::Out.as_i64())
    .bind(now)
    .bind(limit.clamp(1, 500))
    .fetch_all(store.pool())
    .await?;
    rows.into_iter().map(|r| r.into_message(store)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use echomesh_common::models::MessageBlob;

    fn sample(id: &str, direction: Direction, created_at: i64, received_at: i64) -> Message {
        let fp = Fingerprint::parse(&"A".repeat(40)).unwrap();
        Message {
            id: id.to_owned(),
            conv_id: fp.clone(),
            direction,
            sender_fp: fp.clone(),
            recipient_fp: fp,
            created_at,
            server_received_at: received_at,
            status: MessageStatus::Queued,
            attempts: 0,
            last_error: None,
            next_retry_at: 0,
            kind: "msg".into(),
            blob: MessageBlob::outbound("cGF5bG9hZA".into()).encode(),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let msg = sample("m1", Direction::In, 1000, 1500);
        assert!(insert(&store, &msg).await.unwrap());
        assert!(!insert(&store, &msg).await.unwrap());

        let conv = Fingerprint::parse(&"A".repeat(40)).unwrap();
        assert_eq!(list_conversation(&store, &conv, 50).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn blob_is_sealed_at_rest_and_opens_on_read() {
        let store = Store::open_in_memory().await.unwrap();
        let msg = sample("m1", Direction::In, 1000, 1500);
        insert(&store, &msg).await.unwrap();

        let raw: String = sqlx::query_scalar("SELECT blob FROM messages WHERE id = 'm1'")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert!(raw.starts_with("v1:"));
        assert!(!raw.contains("pgp="));

        let found = find(&store, "m1").await.unwrap().unwrap();
        assert_eq!(found.blob, msg.blob);
    }

    #[tokio::test]
    async fn conversation_orders_by_effective_time() {
        let store = Store::open_in_memory().await.unwrap();
        // created late but received never (outbound)
        insert(&store, &sample("OUT:m1", Direction::Out, 3000, 0)).await.unwrap();
        // created early, received even earlier
        insert(&store, &sample("m2", Direction::In, 2000, 1000)).await.unwrap();
        // created early but received late -> effective time 5000, newest
        insert(&store, &sample("m3", Direction::In, 1000, 5000)).await.unwrap();

        let conv = Fingerprint::parse(&"A".repeat(40)).unwrap();
        let listed = list_conversation(&store, &conv, 50).await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m3", "OUT:m1", "m2"]);
    }

    #[tokio::test]
    async fn retry_bookkeeping() {
        let store = Store::open_in_memory().await.unwrap();
        insert(&store, &sample("OUT:m1", Direction::Out, 1000, 0)).await.unwrap();

        mark_queued_retry(&store, "OUT:m1", "QUEUED_HTTP_FAIL_503", 9000).await.unwrap();
        assert!(due_retries(&store, 8999, 10).await.unwrap().is_empty());
        let due = due_retries(&store, 9000, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].attempts, 1);
        assert_eq!(due[0].last_error.as_deref(), Some("QUEUED_HTTP_FAIL_503"));

        mark_sent(&store, "OUT:m1").await.unwrap();
        assert!(due_retries(&store, 10_000, 10).await.unwrap().is_empty());
        let msg = find(&store, "OUT:m1").await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::SentOk);
    }

    #[tokio::test]
    async fn failed_is_terminal_for_sweeps() {
        let store = Store::open_in_memory().await.unwrap();
        insert(&store, &sample("OUT:m1", Direction::Out, 1000, 0)).await.unwrap();
        mark_failed(&store, "OUT:m1", "FAILED_MISSING_ADDRESS").await.unwrap();
        assert!(due_retries(&store, i64::MAX, 10).await.unwrap().is_empty());
    }
}
