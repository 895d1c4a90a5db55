use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use common_lib::types::QueueMessage;
use serde_json::Value;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct QueueMessageRow {
    id: i64,
    kind: String,
    reservation_id: Option<Uuid>,
    disk_id: Option<Uuid>,
    payload: Value,
    enqueued_at: DateTime<Utc>,
    delivery_count: i32,
}

impl From<QueueMessageRow> for QueueMessage {
    fn from(r: QueueMessageRow) -> Self {
        Self {
            id: r.id,
            kind: r.kind,
            reservation_id: r.reservation_id,
            disk_id: r.disk_id,
            payload: r.payload,
            enqueued_at: r.enqueued_at,
            delivery_count: r.delivery_count.max(0) as u32,
        }
    }
}

/// Inserts a message. Takes an explicit connection so callers can enqueue inside the same
/// transaction that writes the subject row - a message never exists without its subject row,
/// and vice versa.
pub async fn enqueue(
    conn: &mut PgConnection,
    queue_name: &str,
    kind: &str,
    reservation_id: Option<Uuid>,
    disk_id: Option<Uuid>,
    payload: Value,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        r#"
        INSERT INTO queue_messages (queue_name, kind, reservation_id, disk_id, payload, enqueued_at, visible_at, delivery_count)
        VALUES ($1, $2, $3, $4, $5, now(), now(), 0)
        RETURNING id
        "#,
    )
    .bind(queue_name)
    .bind(kind)
    .bind(reservation_id)
    .bind(disk_id)
    .bind(payload)
    .fetch_one(&mut *conn)
    .await
    .map_err(|source| Error::Query { source })?;

    Ok(row.0)
}

/// Claims up to `batch_size` visible messages and marks them invisible for
/// `visibility_timeout_seconds`. Uses `FOR UPDATE SKIP LOCKED` so concurrent replicas of the
/// processor never claim the same row.
pub async fn dequeue(
    pool: &PgPool,
    queue_name: &str,
    batch_size: i64,
    visibility_timeout_seconds: i64,
) -> Result<Vec<QueueMessage>> {
    let mut tx = pool.begin().await.map_err(|source| Error::Query { source })?;

    let claimed: Vec<QueueMessageRow> = sqlx::query_as(
        r#"
        WITH claimed AS (
            SELECT id FROM queue_messages
            WHERE queue_name = $1 AND visible_at <= now()
            ORDER BY enqueued_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
        )
        UPDATE queue_messages AS q
        SET visible_at = now() + ($3 || ' seconds')::interval,
            delivery_count = q.delivery_count + 1
        FROM claimed
        WHERE q.id = claimed.id
        RETURNING q.id, q.kind, q.reservation_id, q.disk_id, q.payload, q.enqueued_at, q.delivery_count
        "#,
    )
    .bind(queue_name)
    .bind(batch_size)
    .bind(visibility_timeout_seconds.to_string())
    .fetch_all(&mut *tx)
    .await
    .map_err(|source| Error::Query { source })?;

    tx.commit().await.map_err(|source| Error::Query { source })?;

    Ok(claimed.into_iter().map(Into::into).collect())
}

/// Acks (deletes) a message. Idempotent: acking a message id that no longer exists is not
/// an error.
pub async fn ack(pool: &PgPool, message_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM queue_messages WHERE id = $1")
        .bind(message_id)
        .execute(pool)
        .await
        .map_err(|source| Error::Query { source })?;
    Ok(())
}

/// Makes a message immediately visible again instead of waiting out the rest of its
/// visibility timeout - used when a handler knows upfront it wants fast redelivery (e.g.
/// queued-for-capacity messages re-checked on the next tick).
pub async fn nack(pool: &PgPool, message_id: i64) -> Result<()> {
    sqlx::query("UPDATE queue_messages SET visible_at = now() WHERE id = $1")
        .bind(message_id)
        .execute(pool)
        .await
        .map_err(|source| Error::Query { source })?;
    Ok(())
}

/// Direct existence checks used by the stuck-state and disk reconciliation passes to
/// satisfy the invariant that the queue never outlives its subject row.
pub async fn orphaned_reservation_message_ids(pool: &PgPool, queue_name: &str) -> Result<Vec<i64>> {
    let rows: Vec<(i64,)> = sqlx::query_as(
        r#"
        SELECT q.id FROM queue_messages q
        WHERE q.queue_name = $1 AND q.reservation_id IS NOT NULL
          AND NOT EXISTS (SELECT 1 FROM reservations r WHERE r.id = q.reservation_id)
        "#,
    )
    .bind(queue_name)
    .fetch_all(pool)
    .await
    .map_err(|source| Error::Query { source })?;
    Ok(rows.into_iter().map(|(id,)| id).collect())
}
