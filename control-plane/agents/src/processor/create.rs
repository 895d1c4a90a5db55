use super::Processor;
use crate::naming;
use chrono::Utc;
use cluster_adapter::VolumeMount;
use common_lib::errors::{Error, Result};
use common_lib::types::{CreatePayload, Disk, GpuType, Reservation, ReservationStatus, ALLOWED_GPU_COUNTS};
use uuid::Uuid;

/// Drives a reservation from `pending` through to `active`, or parks it in `queued` when
/// there isn't capacity yet. Safe to redeliver at any point: each step re-reads the
/// reservation's current status before acting.
pub(super) async fn handle(processor: &Processor, message: &common_lib::types::QueueMessage) -> Result<()> {
    let reservation_id = message.reservation_id.ok_or_else(|| Error::Logic { detail: "create message missing reservation_id".to_string() })?;
    let payload: CreatePayload = serde_json::from_value(message.payload.clone()).unwrap_or_default();

    let reservation = store::reservations::get(processor.store.pool(), reservation_id).await?;
    if reservation.status.is_terminal() || reservation.status == ReservationStatus::Active {
        return Ok(());
    }

    if reservation.status == ReservationStatus::Preparing {
        return resume_preparing(processor, &reservation).await;
    }

    let gpu_type = store::gpu_types::get(processor.store.pool(), &reservation.gpu_type).await?;

    if reservation.status == ReservationStatus::Pending {
        validate(processor, &reservation, &gpu_type).await?;
    }

    let Some(node_names) = processor.select_nodes(&gpu_type, reservation.gpu_count).await? else {
        return mark_queued(processor, &reservation).await;
    };

    let volume = resolve_volume(processor, &reservation, &gpu_type, &node_names, payload.confirmed_disk_reassign).await?;
    provision(processor, &reservation, node_names, volume).await
}

/// `pending`'s one-time admission checks: shape validation and the per-user active cap.
/// Capacity is checked separately (and re-checked every redelivery) by `select_nodes`, but a
/// request that can never fit regardless of capacity - more GPUs than a single node of a
/// non-multi-node-capable type can ever hold - is rejected here instead of being parked in
/// `queued` forever.
async fn validate(processor: &Processor, reservation: &Reservation, gpu_type: &GpuType) -> Result<()> {
    if !ALLOWED_GPU_COUNTS.contains(&reservation.gpu_count) {
        return Err(Error::Validation { reason: format!("gpu_count {} is not one of {:?}", reservation.gpu_count, ALLOWED_GPU_COUNTS) });
    }
    if reservation.gpu_count > gpu_type.gpus_per_node && !gpu_type.multi_node_capable {
        return Err(Error::Validation {
            reason: format!(
                "gpu_count {} exceeds the single-node max of {} for non-multi-node type '{}'",
                reservation.gpu_count, gpu_type.gpus_per_node, gpu_type.tag
            ),
        });
    }
    if reservation.duration_hours <= 0.0 || reservation.duration_hours > processor.cfg.effective_max_reservation_hours() {
        return Err(Error::Validation {
            reason: format!("duration_hours {} exceeds the {}h cap", reservation.duration_hours, processor.cfg.effective_max_reservation_hours()),
        });
    }

    let active_count = store::reservations::count_active_for_user(processor.store.pool(), &reservation.user).await?;
    if active_count > processor.cfg.per_user_active_cap as i64 {
        return Err(Error::AdmissionDenied { reason: format!("user {} already has {} active reservations", reservation.user, active_count - 1) });
    }

    Ok(())
}

async fn mark_queued(processor: &Processor, reservation: &Reservation) -> Result<()> {
    processor
        .store
        .with_tx(|tx| {
            let id = reservation.id;
            Box::pin(async move {
                let mut current = store::reservations::get_for_update(tx, id).await?;
                if current.status == ReservationStatus::Pending || current.status == ReservationStatus::Queued {
                    current.status = ReservationStatus::Queued;
                    store::reservations::update(tx, &current).await?;
                }
                Ok(())
            })
        })
        .await?;

    crate::queue_accounting::recompute_for_gpu_type(&processor.store, &reservation.gpu_type).await?;
    // Redeliver shortly so a queued reservation gets re-checked without waiting out the
    // full visibility timeout.
    Ok(())
}

/// A `preparing` reservation redelivered: the pod may already have been created by a prior,
/// now-timed-out delivery. Adopt it instead of allocating again.
async fn resume_preparing(processor: &Processor, reservation: &Reservation) -> Result<()> {
    let sandbox_name = Reservation::sandbox_name_for(reservation.id);
    let namespace = reservation.sandbox_namespace.clone().unwrap_or_else(|| processor.sandbox_namespace.clone());

    let pods = processor.cluster.list_pods(&namespace, "").await?;
    if pods.iter().any(|p| p.name == sandbox_name) {
        return finish_activation(processor, reservation, &namespace).await;
    }

    let gpu_type = store::gpu_types::get(processor.store.pool(), &reservation.gpu_type).await?;
    let Some(node_names) = processor.select_nodes(&gpu_type, reservation.gpu_count).await? else {
        return Ok(()); // stay in preparing; will be retried on the next redelivery
    };
    let volume = resolve_volume(processor, reservation, &gpu_type, &node_names, true).await?;
    provision(processor, reservation, node_names, volume).await
}

/// Resolves what volume (if any) the sandbox mounts: none for ephemeral-only requests, the
/// user's existing named disk (claiming or reassigning it), or a freshly created one.
async fn resolve_volume(processor: &Processor, reservation: &Reservation, gpu_type: &GpuType, node_names: &[String], confirmed_reassign: bool) -> Result<Option<VolumeMount>> {
    if reservation.no_persistent_disk {
        return Ok(Some(VolumeMount { cloud_volume_id: None, mount_path: naming::SANDBOX_MOUNT_PATH.to_string() }));
    }

    let Some(disk_name) = &reservation.disk_name else {
        return Ok(Some(VolumeMount { cloud_volume_id: None, mount_path: naming::SANDBOX_MOUNT_PATH.to_string() }));
    };

    let existing = store::disks::get_by_user_and_name(processor.store.pool(), &reservation.user, disk_name).await?;

    let disk = match existing {
        Some(disk) if disk.in_use && disk.in_use_by != Some(reservation.id) => {
            if !confirmed_reassign {
                return Err(Error::DiskInUse { name: disk_name.clone() });
            }
            claim_disk(processor, disk, reservation.id).await?
        }
        Some(disk) if !disk.in_use => claim_disk(processor, disk, reservation.id).await?,
        Some(disk) => disk, // already claimed by this reservation (redelivery)
        None => create_disk(processor, reservation, gpu_type, node_names).await?,
    };

    Ok(Some(VolumeMount { cloud_volume_id: Some(disk.volume_id), mount_path: naming::SANDBOX_MOUNT_PATH.to_string() }))
}

async fn claim_disk(processor: &Processor, disk: Disk, reservation_id: Uuid) -> Result<Disk> {
    let disk_id = disk.id;
    let _ = processor
        .storage
        .create_snapshot(&disk.volume_id, vec![(crate::naming::RESERVATION_TAG_KEY.to_string(), reservation_id.to_string())])
        .await;
    let updated = processor
        .store
        .with_tx(|tx| {
            Box::pin(async move {
                let mut current = store::disks::get_for_update(tx, disk_id).await?;
                current.in_use = true;
                current.in_use_by = Some(reservation_id);
                store::disks::update(tx, &current).await?;
                Ok(current)
            })
        })
        .await?;
    Ok(updated)
}

async fn create_disk(processor: &Processor, reservation: &Reservation, _gpu_type: &GpuType, node_names: &[String]) -> Result<Disk> {
    let nodes = processor.cluster.list_nodes().await?;
    let az = node_names
        .first()
        .and_then(|name| nodes.iter().find(|n| &n.name == name))
        .and_then(|n| n.labels.get(naming::NODE_ZONE_LABEL_KEY).cloned())
        .unwrap_or_else(|| "default".to_string());

    let tags = vec![
        (naming::USER_TAG_KEY.to_string(), reservation.user.clone()),
        (naming::RESERVATION_TAG_KEY.to_string(), reservation.id.to_string()),
    ];
    let volume_ref = processor.storage.create_volume(100, &az, tags, None).await?;

    let now = Utc::now();
    let disk = Disk {
        id: Uuid::new_v4(),
        user: reservation.user.clone(),
        name: reservation.disk_name.clone().unwrap_or_default(),
        volume_id: volume_ref.id,
        az: volume_ref.az,
        size_gb: 100,
        in_use: true,
        in_use_by: Some(reservation.id),
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

    Ok(disk)
}

async fn provision(processor: &Processor, reservation: &Reservation, node_names: Vec<String>, volume: Option<VolumeMount>) -> Result<()> {
    processor
        .store
        .with_tx(|tx| {
            let id = reservation.id;
            Box::pin(async move {
                let mut current = store::reservations::get_for_update(tx, id).await?;
                if current.status == ReservationStatus::Pending || current.status == ReservationStatus::Queued {
                    current.status = ReservationStatus::Preparing;
                    store::reservations::update(tx, &current).await?;
                }
                Ok(())
            })
        })
        .await?;

    let spec = processor.build_pod_spec(reservation, node_names, volume.clone());
    let namespace = spec.namespace.clone();
    processor.cluster.create_pod(spec).await?;

    if let Some(volume) = &volume {
        if let Some(volume_id) = &volume.cloud_volume_id {
            processor
                .store
                .with_tx(|tx| {
                    let id = reservation.id;
                    let volume_id = volume_id.clone();
                    Box::pin(async move {
                        let mut current = store::reservations::get_for_update(tx, id).await?;
                        current.volume_id = Some(volume_id);
                        store::reservations::update(tx, &current).await
                    })
                })
                .await?;
        }
    }

    finish_activation(processor, reservation, &namespace).await
}

async fn finish_activation(processor: &Processor, reservation: &Reservation, namespace: &str) -> Result<()> {
    let sandbox_name = Reservation::sandbox_name_for(reservation.id);
    let mut selector = std::collections::BTreeMap::new();
    selector.insert(naming::RESERVATION_LABEL_KEY.to_string(), reservation.id.to_string());

    let mut extra_ports = Vec::new();
    if reservation.env.get("GPU_RESERVATION_INTERACTIVE").map(|v| v == "1").unwrap_or(false) {
        extra_ports.push(("notebook".to_string(), naming::NOTEBOOK_CONTAINER_PORT, naming::NOTEBOOK_CONTAINER_PORT));
    }

    let service = cluster_adapter::ServiceSpec {
        name: sandbox_name.clone(),
        namespace: namespace.to_string(),
        selector_labels: selector,
        ssh_target_port: naming::SSH_CONTAINER_PORT,
        extra_ports,
    };
    let service_ref = processor.cluster.create_service(service).await?;

    let now = Utc::now();
    processor
        .store
        .with_tx(|tx| {
            let id = reservation.id;
            let sandbox_name = sandbox_name.clone();
            let namespace = namespace.to_string();
            let service_ref = service_ref.clone();
            Box::pin(async move {
                let mut current = store::reservations::get_for_update(tx, id).await?;
                if current.status == ReservationStatus::Preparing {
                    current.status = ReservationStatus::Active;
                    current.launched_at = Some(now);
                    current.expires_at = Some(now + chrono::Duration::seconds((current.duration_hours * 3600.0) as i64));
                    current.sandbox_name = Some(sandbox_name);
                    current.sandbox_namespace = Some(namespace);
                    current.ssh_endpoint = Some(common_lib::types::SshEndpoint { host: service_ref.host, port: service_ref.port });
                    store::reservations::update(tx, &current).await?;
                }
                Ok(())
            })
        })
        .await?;

    Ok(())
}
