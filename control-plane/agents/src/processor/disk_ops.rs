use super::Processor;
use crate::naming;
use chrono::Utc;
use common_lib::errors::{Error, Result};
use common_lib::types::{Disk, DiskCreatePayload, QueueMessage};

/// Creates a persistent disk outside of the reservation-provisioning path: a standalone
/// request to pre-create a disk a user will later name on a `create`. The disk id is chosen
/// by the caller and carried on the message, so redelivery finds the already-created row
/// instead of allocating a second cloud volume (the same deterministic-naming discipline
/// `Reservation::sandbox_name_for` uses for pods, extended to disks).
pub(super) async fn handle_disk_create(processor: &Processor, message: &QueueMessage) -> Result<()> {
    let disk_id = message.disk_id.ok_or_else(|| Error::Logic { detail: "disk_create message missing disk_id".to_string() })?;
    let payload: DiskCreatePayload = serde_json::from_value(message.payload.clone())
        .map_err(|source| Error::Validation { reason: format!("invalid disk_create payload: {source}") })?;

    if store::disks::get(processor.store.pool(), disk_id).await.is_ok() {
        return Ok(()); // redelivery: already created
    }
    if store::disks::get_by_user_and_name(processor.store.pool(), &payload.user, &payload.name).await?.is_some() {
        return Err(Error::Validation { reason: format!("disk '{}' already exists for user {}", payload.name, payload.user) });
    }

    let size_gb = payload.size_gb.unwrap_or(100);
    let az = payload.az.unwrap_or_else(|| "default".to_string());
    let tags = vec![
        (naming::USER_TAG_KEY.to_string(), payload.user.clone()),
        (naming::GPU_DEV_TAG_KEY.to_string(), naming::GPU_DEV_TAG_VALUE.to_string()),
    ];
    let volume_ref = processor.storage.create_volume(size_gb, &az, tags, None).await?;

    let now = Utc::now();
    let disk = Disk {
        id: disk_id,
        user: payload.user,
        name: payload.name,
        volume_id: volume_ref.id,
        az: volume_ref.az,
        size_gb,
        in_use: false,
        in_use_by: None,
        last_snapshot_id: None,
        pending_snapshot_count: 0,
        completed_snapshot_count: 0,
        creating: false,
        deleting: false,
        soft_deleted_at: None,
        last_reconciled_at: Some(now),
        created_at: now,
    };

    processor
        .store
        .with_tx(|tx| {
            let disk = disk.clone();
            Box::pin(async move { store::disks::insert(tx, &disk).await })
        })
        .await?;

    Ok(())
}

/// Soft-deletes a disk; refused while it's attached to an active reservation. The backing
/// cloud volume is removed later, once it's past the sweeper's retention window.
pub(super) async fn handle_disk_delete(processor: &Processor, message: &QueueMessage) -> Result<()> {
    let disk_id = message.disk_id.ok_or_else(|| Error::Logic { detail: "disk_delete message missing disk_id".to_string() })?;
    let disk = store::disks::get(processor.store.pool(), disk_id).await?;

    if disk.soft_deleted_at.is_some() {
        return Ok(());
    }
    if disk.in_use {
        return Err(Error::AdmissionDenied { reason: "disk is in use by an active reservation".to_string() });
    }

    processor
        .store
        .with_tx(|tx| {
            Box::pin(async move {
                let mut current = store::disks::get_for_update(tx, disk_id).await?;
                if current.soft_deleted_at.is_none() {
                    current.soft_deleted_at = Some(Utc::now());
                    store::disks::update(tx, &current).await?;
                }
                Ok(())
            })
        })
        .await?;

    Ok(())
}
