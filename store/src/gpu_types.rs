use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use common_lib::types::GpuType;
use sqlx::{FromRow, PgConnection, PgPool};

#[derive(FromRow)]
struct GpuTypeRow {
    tag: String,
    instance_family: String,
    gpus_per_node: i32,
    cpu_per_node: i32,
    memory_gb_per_node: i32,
    active: bool,
    multi_node_capable: bool,
    total_gpus: i32,
    available_gpus: i32,
    max_reservable: i32,
    full_nodes_available: i32,
    running_instances: i32,
    last_updated_at: Option<DateTime<Utc>>,
    updated_by: Option<String>,
}

impl From<GpuTypeRow> for GpuType {
    fn from(r: GpuTypeRow) -> Self {
        Self {
            tag: r.tag,
            instance_family: r.instance_family,
            gpus_per_node: r.gpus_per_node.max(0) as u32,
            cpu_per_node: r.cpu_per_node.max(0) as u32,
            memory_gb_per_node: r.memory_gb_per_node.max(0) as u32,
            active: r.active,
            multi_node_capable: r.multi_node_capable,
            total_gpus: r.total_gpus.max(0) as u32,
            available_gpus: r.available_gpus.max(0) as u32,
            max_reservable: r.max_reservable.max(0) as u32,
            full_nodes_available: r.full_nodes_available.max(0) as u32,
            running_instances: r.running_instances.max(0) as u32,
            last_updated_at: r.last_updated_at,
            updated_by: r.updated_by,
        }
    }
}

pub async fn get(pool: &PgPool, tag: &str) -> Result<GpuType> {
    let row: GpuTypeRow = sqlx::query_as("SELECT * FROM gpu_types WHERE tag = $1")
        .bind(tag)
        .fetch_optional(pool)
        .await
        .map_err(|source| Error::Query { source })?
        .ok_or_else(|| Error::NotFound { what: "gpu type".to_string(), id: tag.to_string() })?;
    Ok(row.into())
}

/// Locks the catalog row for the duration of the allocate step: the target node is picked
/// against a consistent snapshot of availability.
pub async fn get_for_update(conn: &mut PgConnection, tag: &str) -> Result<GpuType> {
    let row: GpuTypeRow = sqlx::query_as("SELECT * FROM gpu_types WHERE tag = $1 FOR UPDATE")
        .bind(tag)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|source| Error::Query { source })?
        .ok_or_else(|| Error::NotFound { what: "gpu type".to_string(), id: tag.to_string() })?;
    Ok(row.into())
}

pub async fn list_active(pool: &PgPool) -> Result<Vec<GpuType>> {
    let rows: Vec<GpuTypeRow> = sqlx::query_as("SELECT * FROM gpu_types WHERE active")
        .fetch_all(pool)
        .await
        .map_err(|source| Error::Query { source })?;
    Ok(rows.into_iter().map(Into::into).collect())
}

/// Upserts the dynamic availability columns for one tick of one GPU type. Static catalog
/// columns (instance family, GPUs per node...) are operator-managed and untouched here.
#[allow(clippy::too_many_arguments)]
pub async fn upsert_availability(
    conn: &mut PgConnection,
    tag: &str,
    total_gpus: u32,
    available_gpus: u32,
    max_reservable: u32,
    full_nodes_available: u32,
    running_instances: u32,
    updated_by: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE gpu_types SET
            total_gpus = $2, available_gpus = $3, max_reservable = $4,
            full_nodes_available = $5, running_instances = $6,
            last_updated_at = now(), updated_by = $7
        WHERE tag = $1
        "#,
    )
    .bind(tag)
    .bind(total_gpus as i32)
    .bind(available_gpus as i32)
    .bind(max_reservable as i32)
    .bind(full_nodes_available as i32)
    .bind(running_instances as i32)
    .bind(updated_by)
    .execute(&mut *conn)
    .await
    .map_err(|source| Error::Query { source })?;
    Ok(())
}
