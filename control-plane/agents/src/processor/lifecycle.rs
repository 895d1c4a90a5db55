use super::Processor;
use chrono::Utc;
use common_lib::errors::{Error, Result};
use common_lib::types::{ExtendPayload, QueueMessage, ReservationStatus};

/// Cancels a reservation from any non-terminal state. Active reservations get the same
/// teardown the sweeper gives an expiring one (snapshot, pod/service delete, disk release);
/// anything earlier just needs its status flipped before a `create` redelivery can act on
/// a stale view of it.
pub(super) async fn handle_cancel(processor: &Processor, message: &QueueMessage) -> Result<()> {
    let reservation_id = message.reservation_id.ok_or_else(|| Error::Logic { detail: "cancel message missing reservation_id".to_string() })?;
    let reservation = store::reservations::get(processor.store.pool(), reservation_id).await?;

    if !reservation.status.is_cancellable() {
        return Ok(());
    }

    if reservation.status == ReservationStatus::Active {
        if let Some(volume_id) = &reservation.volume_id {
            let _ = processor.storage.create_snapshot(volume_id, vec![(crate::naming::RESERVATION_TAG_KEY.to_string(), reservation.id.to_string())]).await;
        }
        if let Some(sandbox_name) = &reservation.sandbox_name {
            let namespace = reservation.sandbox_namespace.clone().unwrap_or_else(|| processor.sandbox_namespace.clone());
            let _ = processor.cluster.delete_pod(sandbox_name, &namespace, 30).await;
            let _ = processor.cluster.delete_service(sandbox_name, &namespace).await;
        }
    }

    if let Some(disk_name) = &reservation.disk_name {
        if let Some(disk) = store::disks::get_by_user_and_name(processor.store.pool(), &reservation.user, disk_name).await? {
            if disk.in_use_by == Some(reservation.id) {
                processor
                    .store
                    .with_tx(|tx| {
                        let id = disk.id;
                        Box::pin(async move { store::disks::clear_in_use(tx, id).await })
                    })
                    .await?;
            }
        }
    }

    let gpu_type = reservation.gpu_type.clone();
    let now = Utc::now();
    processor
        .store
        .with_tx(|tx| {
            let id = reservation.id;
            Box::pin(async move {
                let mut current = store::reservations::get_for_update(tx, id).await?;
                if current.status.is_cancellable() {
                    current.status = ReservationStatus::Cancelled;
                    current.ended_at = Some(now);
                    store::reservations::update(tx, &current).await?;
                }
                Ok(())
            })
        })
        .await?;

    crate::queue_accounting::recompute_for_gpu_type(&processor.store, &gpu_type).await?;
    Ok(())
}

/// Extends an active reservation's `expires_at`. A reservation may be extended at most
/// once, a rule folded into `effective_max_reservation_hours`: the total duration after
/// extension may never exceed the configured cap.
pub(super) async fn handle_extend(processor: &Processor, message: &QueueMessage) -> Result<()> {
    let reservation_id = message.reservation_id.ok_or_else(|| Error::Logic { detail: "extend message missing reservation_id".to_string() })?;
    let payload: ExtendPayload = serde_json::from_value(message.payload.clone()).unwrap_or_default();
    let additional_hours = payload.additional_hours.unwrap_or(processor.cfg.extension_hours);

    let reservation = store::reservations::get(processor.store.pool(), reservation_id).await?;
    if reservation.status != ReservationStatus::Active {
        return Ok(());
    }
    if reservation.extension_count >= 1 {
        return Err(Error::AdmissionDenied { reason: "reservation has already been extended once".to_string() });
    }

    let new_total_hours = reservation.duration_hours + additional_hours;
    if new_total_hours > processor.cfg.effective_max_reservation_hours() {
        return Err(Error::AdmissionDenied {
            reason: format!("extension would bring total duration to {new_total_hours}h, over the {}h cap", processor.cfg.effective_max_reservation_hours()),
        });
    }

    processor
        .store
        .with_tx(|tx| {
            let id = reservation.id;
            Box::pin(async move {
                let mut current = store::reservations::get_for_update(tx, id).await?;
                if current.status == ReservationStatus::Active && current.extension_count == 0 {
                    current.duration_hours = new_total_hours;
                    current.extension_count += 1;
                    if let Some(expires_at) = current.expires_at {
                        current.expires_at = Some(expires_at + chrono::Duration::seconds((additional_hours * 3600.0) as i64));
                    }
                    current.warnings_sent.clear();
                    store::reservations::update(tx, &current).await?;
                }
                Ok(())
            })
        })
        .await?;

    Ok(())
}
