use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use common_lib::types::Disk;
use sqlx::{FromRow, PgConnection, PgPool};
use uuid::Uuid;

#[derive(FromRow)]
struct DiskRow {
    id: Uuid,
    user_name: String,
    name: String,
    volume_id: String,
    az: String,
    size_gb: i32,
    in_use: bool,
    in_use_by: Option<Uuid>,
    last_snapshot_id: Option<String>,
    pending_snapshot_count: i32,
    completed_snapshot_count: i32,
    creating: bool,
    deleting: bool,
    soft_deleted_at: Option<DateTime<Utc>>,
    last_reconciled_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
}

impl From<DiskRow> for Disk {
    fn from(r: DiskRow) -> Self {
        Self {
            id: r.id,
            user: r.user_name,
            name: r.name,
            volume_id: r.volume_id,
            az: r.az,
            size_gb: r.size_gb.max(0) as u32,
            in_use: r.in_use,
            in_use_by: r.in_use_by,
            last_snapshot_id: r.last_snapshot_id,
            pending_snapshot_count: r.pending_snapshot_count.max(0) as u32,
            completed_snapshot_count: r.completed_snapshot_count.max(0) as u32,
            creating: r.creating,
            deleting: r.deleting,
            soft_deleted_at: r.soft_deleted_at,
            last_reconciled_at: r.last_reconciled_at,
            created_at: r.created_at,
        }
    }
}

pub async fn insert(conn: &mut PgConnection, d: &Disk) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO disks (id, user_name, name, volume_id, az, size_gb, in_use, in_use_by,
            last_snapshot_id, pending_snapshot_count, completed_snapshot_count, creating,
            deleting, soft_deleted_at, last_reconciled_at, created_at)
        VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)
        "#,
    )
    .bind(d.id)
    .bind(&d.user)
    .bind(&d.name)
    .bind(&d.volume_id)
    .bind(&d.az)
    .bind(d.size_gb as i32)
    .bind(d.in_use)
    .bind(d.in_use_by)
    .bind(&d.last_snapshot_id)
    .bind(d.pending_snapshot_count as i32)
    .bind(d.completed_snapshot_count as i32)
    .bind(d.creating)
    .bind(d.deleting)
    .bind(d.soft_deleted_at)
    .bind(d.last_reconciled_at)
    .bind(d.created_at)
    .execute(&mut *conn)
    .await
    .map_err(|source| Error::Query { source })?;
    Ok(())
}

pub async fn get(pool: &PgPool, id: Uuid) -> Result<Disk> {
    let row: DiskRow = sqlx::query_as("SELECT * FROM disks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .map_err(|source| Error::Query { source })?
        .ok_or_else(|| Error::NotFound { what: "disk".to_string(), id: id.to_string() })?;
    Ok(row.into())
}

pub async fn get_by_user_and_name(pool: &PgPool, user: &str, name: &str) -> Result<Option<Disk>> {
    let row: Option<DiskRow> = sqlx::query_as(
        "SELECT * FROM disks WHERE user_name = $1 AND name = $2 AND soft_deleted_at IS NULL",
    )
    .bind(user)
    .bind(name)
    .fetch_optional(pool)
    .await
    .map_err(|source| Error::Query { source })?;
    Ok(row.map(Into::into))
}

pub async fn get_for_update(conn: &mut PgConnection, id: Uuid) -> Result<Disk> {
    let row: DiskRow = sqlx::query_as("SELECT * FROM disks WHERE id = $1 FOR UPDATE")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|source| Error::Query { source })?
        .ok_or_else(|| Error::NotFound { what: "disk".to_string(), id: id.to_string() })?;
    Ok(row.into())
}

pub async fn get_by_volume_id(pool: &PgPool, volume_id: &str) -> Result<Option<Disk>> {
    let row: Option<DiskRow> = sqlx::query_as("SELECT * FROM disks WHERE volume_id = $1")
        .bind(volume_id)
        .fetch_optional(pool)
        .await
        .map_err(|source| Error::Query { source })?;
    Ok(row.map(Into::into))
}

pub async fn update(conn: &mut PgConnection, d: &Disk) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE disks SET
            volume_id = $2, az = $3, size_gb = $4, in_use = $5, in_use_by = $6,
            last_snapshot_id = $7, pending_snapshot_count = $8, completed_snapshot_count = $9,
            creating = $10, deleting = $11, soft_deleted_at = $12, last_reconciled_at = $13
        WHERE id = $1
        "#,
    )
    .bind(d.id)
    .bind(&d.volume_id)
    .bind(&d.az)
    .bind(d.size_gb as i32)
    .bind(d.in_use)
    .bind(d.in_use_by)
    .bind(&d.last_snapshot_id)
    .bind(d.pending_snapshot_count as i32)
    .bind(d.completed_snapshot_count as i32)
    .bind(d.creating)
    .bind(d.deleting)
    .bind(d.soft_deleted_at)
    .bind(d.last_reconciled_at)
    .execute(&mut *conn)
    .await
    .map_err(|source| Error::Query { source })?;
    Ok(())
}

/// Clears `in_use`/`in_use_by` on cancel, expiry, or when provisioning fails after
/// tentatively claiming a disk.
pub async fn clear_in_use(conn: &mut PgConnection, id: Uuid) -> Result<()> {
    sqlx::query("UPDATE disks SET in_use = false, in_use_by = NULL WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|source| Error::Query { source })?;
    Ok(())
}

pub async fn list_all(pool: &PgPool) -> Result<Vec<Disk>> {
    let rows: Vec<DiskRow> = sqlx::query_as("SELECT * FROM disks")
        .fetch_all(pool)
        .await
        .map_err(|source| Error::Query { source })?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Candidates for hard deletion: soft-deleted past the retention window.
pub async fn list_past_retention(pool: &PgPool, retention_days: i32) -> Result<Vec<Disk>> {
    let rows: Vec<DiskRow> = sqlx::query_as(
        "SELECT * FROM disks WHERE soft_deleted_at IS NOT NULL AND soft_deleted_at <= now() - ($1 || ' days')::interval",
    )
    .bind(retention_days.to_string())
    .fetch_all(pool)
    .await
    .map_err(|source| Error::Query { source })?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn hard_delete(conn: &mut PgConnection, id: Uuid) -> Result<()> {
    sqlx::query("DELETE FROM disks WHERE id = $1")
        .bind(id)
        .execute(&mut *conn)
        .await
        .map_err(|source| Error::Query { source })?;
    Ok(())
}
