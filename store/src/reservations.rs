use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use common_lib::types::{Reservation, ReservationEvent, ReservationStatus, SshEndpoint};
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection, PgPool};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;
use uuid::Uuid;

#[derive(FromRow)]
struct ReservationRow {
    id: Uuid,
    user_name: String,
    gpu_type: String,
    gpu_count: i32,
    duration_hours: f64,
    disk_name: Option<String>,
    no_persistent_disk: bool,
    docker_image: Option<String>,
    env: Json<BTreeMap<String, String>>,
    status: String,
    created_at: DateTime<Utc>,
    launched_at: Option<DateTime<Utc>>,
    ended_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
    sandbox_name: Option<String>,
    sandbox_namespace: Option<String>,
    ssh_host: Option<String>,
    ssh_port: Option<i32>,
    queue_position: Option<i32>,
    eta_minutes: Option<i32>,
    failure_reason: Option<String>,
    warnings_sent: Vec<i32>,
    extension_count: i32,
    collaborators: Vec<String>,
    events: Json<Vec<ReservationEvent>>,
    volume_id: Option<String>,
}

impl TryFrom<ReservationRow> for Reservation {
    type Error = Error;

    fn try_from(r: ReservationRow) -> std::result::Result<Self, Error> {
        let status = ReservationStatus::from_str(&r.status).map_err(|_| Error::NotFound {
            what: "reservation status".to_string(),
            id: r.status.clone(),
        })?;
        Ok(Reservation {
            id: r.id,
            user: r.user_name,
            gpu_type: r.gpu_type,
            gpu_count: r.gpu_count.max(0) as u32,
            duration_hours: r.duration_hours,
            disk_name: r.disk_name,
            no_persistent_disk: r.no_persistent_disk,
            docker_image: r.docker_image,
            env: r.env.0,
            status,
            created_at: r.created_at,
            launched_at: r.launched_at,
            ended_at: r.ended_at,
            expires_at: r.expires_at,
            sandbox_name: r.sandbox_name,
            sandbox_namespace: r.sandbox_namespace,
            ssh_endpoint: match (r.ssh_host, r.ssh_port) {
                (Some(host), Some(port)) => Some(SshEndpoint { host, port: port.max(0) as u16 }),
                _ => None,
            },
            queue_position: r.queue_position.map(|v| v.max(0) as u32),
            eta_minutes: r.eta_minutes.map(|v| v.max(0) as u32),
            failure_reason: r.failure_reason,
            warnings_sent: r.warnings_sent.into_iter().map(|v| v.max(0) as u64).collect::<BTreeSet<_>>(),
            extension_count: r.extension_count.max(0) as u32,
            collaborators: r.collaborators,
            events: r.events.0,
            volume_id: r.volume_id,
        })
    }
}

/// Inserts a new reservation in `pending` status. Callers that must enqueue a `create`
/// message atomically with this insert pass the same `&mut PgConnection` to both this and
/// `queue::enqueue` inside one `with_tx` closure.
pub async fn insert(conn: &mut PgConnection, r: &Reservation) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO reservations
            (id, user_name, gpu_type, gpu_count, duration_hours, disk_name, no_persistent_disk,
             docker_image, env, status, created_at, extension_count, collaborators, events, warnings_sent)
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0, $12, $13, ARRAY[]::int[])
        "#,
    )
    .bind(r.id)
    .bind(&r.user)
    .bind(&r.gpu_type)
    .bind(r.gpu_count as i32)
    .bind(r.duration_hours)
    .bind(&r.disk_name)
    .bind(r.no_persistent_disk)
    .bind(&r.docker_image)
    .bind(Json(&r.env))
    .bind(r.status.to_string())
    .bind(r.created_at)
    .bind(&r.collaborators)
    .bind(Json(&r.events))
    .execute(&mut *conn)
    .await
    .map_err(|source| Error::Query { source })?;
    Ok(())
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Reservation> {
    let row: ReservationRow = sqlx::query_as("SELECT * FROM reservations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|source| Error::Query { source })?
        .ok_or_else(|| Error::NotFound { what: "reservation".to_string(), id: id.to_string() })?;
    row.try_into()
}

/// Locks the row for the duration of the caller's transaction. Used by every handler
/// before re-reading status and deciding whether to act: read current status first, take
/// action only if status still warrants it.
pub async fn get_for_update(conn: &mut PgConnection, id: Uuid) -> Result<Reservation> {
    let row: ReservationRow = sqlx::query_as("SELECT * FROM reservations WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|source| Error::Query { source })?
        .ok_or_else(|| Error::NotFound { what: "reservation".to_string(), id: id.to_string() })?;
    row.try_into()
}

/// Compare-and-set the status column. Returns `Ok(false)` (not an error) when another
/// writer already advanced the row past `expected` - the caller's job is to unwind
/// gracefully rather than treat the race as a failure.
pub async fn cas_status(
    conn: &mut PgConnection,
    id: Uuid,
    expected: ReservationStatus,
    new: ReservationStatus,
) -> Result<bool> {
    let result = sqlx::query("UPDATE reservations SET status = $1 WHERE id = $2 AND status = $3")
        .bind(new.to_string())
        .bind(id)
        .bind(expected.to_string())
        .execute(&mut *conn)
        .await
        .map_err(|source| Error::Query { source })?;
    Ok(result.rows_affected() == 1)
}

/// Full row replace, used after allocate/provision/extend steps compute several fields at
/// once. Always called from inside a transaction that already holds the row lock via
/// `get_for_update`.
pub async fn update(conn: &mut PgConnection, r: &Reservation) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE reservations SET
            status = $2, launched_at = $3, ended_at = $4, expires_at = $5,
            sandbox_name = $6, sandbox_namespace = $7, ssh_host = $8, ssh_port = $9,
            queue_position = $10, eta_minutes = $11, failure_reason = $12,
            warnings_sent = $13, extension_count = $14, collaborators = $15,
            events = $16, volume_id = $17, duration_hours = $18
        WHERE id = $1
        "#,
    )
    .bind(r.id)
    .bind(r.status.to_string())
    .bind(r.launched_at)
    .bind(r.ended_at)
    .bind(r.expires_at)
    .bind(&r.sandbox_name)
    .bind(&r.sandbox_namespace)
    .bind(r.ssh_endpoint.as_ref().map(|e| e.host.clone()))
    .bind(r.ssh_endpoint.as_ref().map(|e| e.port as i32))
    .bind(r.queue_position.map(|v| v as i32))
    .bind(r.eta_minutes.map(|v| v as i32))
    .bind(&r.failure_reason)
    .bind(r.warnings_sent.iter().map(|v| *v as i32).collect::<Vec<_>>())
    .bind(r.extension_count as i32)
    .bind(&r.collaborators)
    .bind(Json(&r.events))
    .bind(&r.volume_id)
    .bind(r.duration_hours)
    .execute(&mut *conn)
    .await
    .map_err(|source| Error::Query { source })?;
    Ok(())
}

pub async fn list_by_status(pool: &PgPool, status: ReservationStatus) -> Result<Vec<Reservation>> {
    let rows: Vec<ReservationRow> = sqlx::query_as("SELECT * FROM reservations WHERE status = $1")
        .bind(status.to_string())
        .fetch_all(pool)
        .await
        .map_err(|source| Error::Query { source })?;
    rows.into_iter().map(TryInto::try_into).collect()
}

/// Waiters of a given GPU type, oldest first - the ranking queue accounting uses to assign
/// FIFO position and ETA.
pub async fn list_queued_by_gpu_type(pool: &PgPool, gpu_type: &str) -> Result<Vec<Reservation>> {
    let rows: Vec<ReservationRow> = sqlx::query_as(
        "SELECT * FROM reservations WHERE status = 'queued' AND gpu_type = $1 ORDER BY created_at ASC",
    )
    .bind(gpu_type)
    .fetch_all(pool)
    .await
    .map_err(|source| Error::Query { source })?;
    rows.into_iter().map(TryInto::try_into).collect()
}

pub async fn list_active_by_gpu_type(pool: &PgPool, gpu_type: &str) -> Result<Vec<Reservation>> {
    let rows: Vec<ReservationRow> = sqlx::query_as(
        "SELECT * FROM reservations WHERE status = 'active' AND gpu_type = $1",
    )
    .bind(gpu_type)
    .fetch_all(pool)
    .await
    .map_err(|source| Error::Query { source })?;
    rows.into_iter().map(TryInto::try_into).collect()
}

/// Enforces the per-user active cap: pending/queued/preparing/active all count as "active"
/// for admission purposes.
pub async fn count_active_for_user(pool: &PgPool, user: &str) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT count(*) FROM reservations WHERE user_name = $1 AND status IN ('pending','queued','preparing','active')",
    )
    .bind(user)
    .fetch_one(pool)
    .await
    .map_err(|source| Error::Query { source })?;
    Ok(row.0)
}

pub async fn find_disk_holder(pool: &PgPool, disk_id: Uuid) -> Result<Option<Reservation>> {
    let row: Option<ReservationRow> = sqlx::query_as(
        "SELECT r.* FROM reservations r WHERE r.status IN ('preparing','active')
         AND r.disk_name IS NOT NULL
         AND EXISTS (SELECT 1 FROM disks d WHERE d.id = $1 AND d.name = r.disk_name AND d.user_name = r.user_name)",
    )
    .bind(disk_id)
    .fetch_optional(pool)
    .await
    .map_err(|source| Error::Query { source })?;
    row.map(TryInto::try_into).transpose()
}
