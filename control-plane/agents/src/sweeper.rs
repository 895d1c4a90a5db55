//! Expiry sweeper: delivers pre-expiry warnings, ends reservations whose time is up,
//! fails reservations stuck in a transient state too long, and keeps snapshot/disk
//! retention converged.

use crate::{naming, queue_accounting, retry};
use chrono::{DateTime, Utc};
use cluster_adapter::{CloudStorage, ClusterCompute, SnapshotLifecycle};
use common_lib::errors::Result;
use common_lib::types::{Reservation, ReservationEvent, ReservationStatus};
use std::sync::Arc;

pub struct Sweeper {
    store: store::Store,
    cluster: Arc<dyn ClusterCompute>,
    storage: Arc<dyn CloudStorage>,
    sandbox_namespace: String,
}

impl Sweeper {
    pub fn new(store: store::Store, cluster: Arc<dyn ClusterCompute>, storage: Arc<dyn CloudStorage>, sandbox_namespace: impl Into<String>) -> Self {
        Self { store, cluster, storage, sandbox_namespace: sandbox_namespace.into() }
    }

    #[tracing::instrument(skip(self, cfg))]
    pub async fn tick(&self, cfg: &common_lib::config::ProcessConfig) {
        let now = Utc::now();

        if let Err(error) = self.send_warnings(&cfg.warning_minutes, now).await {
            tracing::error!(%error, "warning pass failed");
        }
        if let Err(error) = self.expire_reservations(cfg.grace_period_seconds, now).await {
            tracing::error!(%error, "expiry pass failed");
        }
        if let Err(error) = self.sweep_stuck(cfg.stuck_preparing_minutes, cfg.stuck_queued_minutes, now).await {
            tracing::error!(%error, "stuck-state pass failed");
        }
        if let Err(error) = self.detect_oom(now).await {
            tracing::error!(%error, "oom detection pass failed");
        }
        if let Err(error) = self.snapshot_housekeeping(cfg.snapshot_retention_count).await {
            tracing::error!(%error, "snapshot housekeeping failed");
        }
        if let Err(error) = self.purge_expired_disks(cfg.soft_delete_retention_days).await {
            tracing::error!(%error, "disk purge failed");
        }
        if let Err(error) = self.purge_orphaned_queue_messages(&cfg.queue_name).await {
            tracing::error!(%error, "orphaned queue message purge failed");
        }
    }

    /// Acks any queue message whose subject reservation row no longer exists. The "a
    /// message never outlives its row" invariant holds by construction on the write path
    /// (enqueue happens in the same transaction as the insert), but a row can still be
    /// deleted out from under a message by an operator, so this is a belt-and-braces sweep.
    async fn purge_orphaned_queue_messages(&self, queue_name: &str) -> Result<()> {
        let orphaned = store::queue::orphaned_reservation_message_ids(self.store.pool(), queue_name).await?;
        for message_id in orphaned {
            tracing::warn!(message_id, "acking queue message with no subject reservation");
            store::queue::ack(self.store.pool(), message_id).await?;
        }
        Ok(())
    }

    /// Writes a marker file into the sandbox at each configured warning threshold, once
    /// per threshold per reservation (tracked via `Reservation.warnings_sent`).
    async fn send_warnings(&self, warning_minutes: &[u64], now: DateTime<Utc>) -> Result<()> {
        let active = store::reservations::list_by_status(self.store.pool(), ReservationStatus::Active).await?;

        for reservation in active {
            let Some(minutes_left) = reservation.minutes_to_expiry(now) else { continue };
            if minutes_left < 0 {
                continue;
            }
            let Some(sandbox_name) = reservation.sandbox_name.clone() else { continue };

            for &level in warning_minutes {
                if reservation.warnings_sent.contains(&level) {
                    continue;
                }
                if minutes_left as u64 > level {
                    continue;
                }

                let path = naming::warning_marker_path(level);
                let wrote = retry::with_retry(3, || {
                    self.cluster.write_file_in_pod(&self.sandbox_namespace, &sandbox_name, &path, format!("{level}\n").as_bytes())
                })
                .await;

                match wrote {
                    Ok(()) => {
                        self.store
                            .with_tx(|tx| {
                                let id = reservation.id;
                                let level = level;
                                Box::pin(async move {
                                    let mut current = store::reservations::get_for_update(tx, id).await?;
                                    if current.status == ReservationStatus::Active {
                                        current.warnings_sent.insert(level);
                                        store::reservations::update(tx, &current).await?;
                                    }
                                    Ok(())
                                })
                            })
                            .await?;
                    }
                    Err(error) => {
                        tracing::warn!(%error, reservation = %reservation.id, level, "failed to deliver warning marker, retrying next tick");
                    }
                }
            }
        }

        Ok(())
    }

    /// Ends every active reservation whose `expires_at` (plus grace period) has passed:
    /// snapshots the disk if one is attached, tears down the pod/service, frees the disk,
    /// and marks the row `expired`.
    async fn expire_reservations(&self, grace_period_seconds: u64, now: DateTime<Utc>) -> Result<()> {
        let active = store::reservations::list_by_status(self.store.pool(), ReservationStatus::Active).await?;
        let grace = chrono::Duration::seconds(grace_period_seconds as i64);

        for reservation in active {
            let Some(expires_at) = reservation.expires_at else { continue };
            if now < expires_at + grace {
                continue;
            }
            if let Err(error) = self.expire_one(&reservation, now).await {
                tracing::error!(%error, reservation = %reservation.id, "failed to expire reservation, will retry next tick");
            }
        }

        Ok(())
    }

    async fn expire_one(&self, reservation: &Reservation, now: DateTime<Utc>) -> Result<()> {
        if let Some(volume_id) = &reservation.volume_id {
            match retry::with_retry(3, || {
                self.storage.create_snapshot(volume_id, vec![(naming::RESERVATION_TAG_KEY.to_string(), reservation.id.to_string())])
            })
            .await
            {
                Ok(_) => {
                    if let Some(disk_name) = &reservation.disk_name {
                        if let Some(disk) = store::disks::get_by_user_and_name(self.store.pool(), &reservation.user, disk_name).await? {
                            self.store
                                .with_tx(|tx| {
                                    let mut disk = disk.clone();
                                    Box::pin(async move {
                                        disk.pending_snapshot_count += 1;
                                        store::disks::update(tx, &disk).await
                                    })
                                })
                                .await?;
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, reservation = %reservation.id, "final snapshot failed, expiring anyway");
                }
            }
        }

        if let Some(sandbox_name) = &reservation.sandbox_name {
            let namespace = reservation.sandbox_namespace.clone().unwrap_or_else(|| self.sandbox_namespace.clone());
            let _ = retry::with_retry(3, || self.cluster.delete_pod(sandbox_name, &namespace, 30)).await;
            let _ = retry::with_retry(3, || self.cluster.delete_service(sandbox_name, &namespace)).await;
        }

        if let Some(disk_name) = &reservation.disk_name {
            if let Some(disk) = store::disks::get_by_user_and_name(self.store.pool(), &reservation.user, disk_name).await? {
                self.store
                    .with_tx(|tx| {
                        let id = disk.id;
                        Box::pin(async move { store::disks::clear_in_use(tx, id).await })
                    })
                    .await?;
            }
        }

        let gpu_type = reservation.gpu_type.clone();
        self.store
            .with_tx(|tx| {
                let id = reservation.id;
                let now = now;
                Box::pin(async move {
                    let mut current = store::reservations::get_for_update(tx, id).await?;
                    if current.status == ReservationStatus::Active {
                        current.status = ReservationStatus::Expired;
                        current.ended_at = Some(now);
                        store::reservations::update(tx, &current).await?;
                    }
                    Ok(())
                })
            })
            .await?;

        queue_accounting::recompute_for_gpu_type(&self.store, &gpu_type).await?;
        Ok(())
    }

    /// Fails reservations stuck provisioning too long - a processor crash mid-provision, or
    /// a message that kept nacking - and cancels admissions that have aged out before ever
    /// reaching a node: queued/pending rows whose admission is no longer valid (GPU type
    /// deactivated or removed from the catalog) are cancelled immediately, the rest age out
    /// on the same threshold so nothing waits on capacity forever.
    async fn sweep_stuck(&self, stuck_preparing_minutes: u64, stuck_queued_minutes: u64, now: DateTime<Utc>) -> Result<()> {
        self.fail_stuck_preparing(stuck_preparing_minutes, now).await?;
        self.cancel_stuck(ReservationStatus::Queued, stuck_queued_minutes, now).await?;
        self.cancel_stuck(ReservationStatus::Pending, stuck_queued_minutes, now).await?;
        Ok(())
    }

    async fn fail_stuck_preparing(&self, threshold_minutes: u64, now: DateTime<Utc>) -> Result<()> {
        let rows = store::reservations::list_by_status(self.store.pool(), ReservationStatus::Preparing).await?;
        for reservation in rows {
            let age_minutes = (now - reservation.created_at).num_minutes();
            if age_minutes < threshold_minutes as i64 {
                continue;
            }
            let gpu_type = reservation.gpu_type.clone();
            self.store
                .with_tx(|tx| {
                    let id = reservation.id;
                    let now = now;
                    Box::pin(async move {
                        let mut current = store::reservations::get_for_update(tx, id).await?;
                        if current.status == ReservationStatus::Preparing {
                            current.status = ReservationStatus::Failed;
                            current.ended_at = Some(now);
                            current.failure_reason = Some(format!("stuck in preparing for over {threshold_minutes} minutes"));
                            store::reservations::update(tx, &current).await?;
                        }
                        Ok(())
                    })
                })
                .await?;
            queue_accounting::recompute_for_gpu_type(&self.store, &gpu_type).await?;
        }
        Ok(())
    }

    /// Cancels `queued`/`pending` reservations whose admission is no longer valid (the GPU
    /// type was deactivated or removed from the catalog since they were admitted), or that
    /// have simply aged past the threshold waiting on capacity that never freed up. Neither
    /// case is a provisioning failure, so these end `cancelled`, not `failed`.
    async fn cancel_stuck(&self, status: ReservationStatus, threshold_minutes: u64, now: DateTime<Utc>) -> Result<()> {
        let rows = store::reservations::list_by_status(self.store.pool(), status).await?;
        for reservation in rows {
            let age_minutes = (now - reservation.created_at).num_minutes();
            let admission_still_valid = match store::gpu_types::get(self.store.pool(), &reservation.gpu_type).await {
                Ok(gpu_type) => gpu_type.active,
                Err(_) => false,
            };
            if admission_still_valid && age_minutes < threshold_minutes as i64 {
                continue;
            }

            let reason = if !admission_still_valid {
                format!("gpu type '{}' is no longer available", reservation.gpu_type)
            } else {
                format!("stuck in {status} for over {threshold_minutes} minutes")
            };

            let gpu_type = reservation.gpu_type.clone();
            self.store
                .with_tx(|tx| {
                    let id = reservation.id;
                    let now = now;
                    let reason = reason.clone();
                    Box::pin(async move {
                        let mut current = store::reservations::get_for_update(tx, id).await?;
                        if current.status == status {
                            current.status = ReservationStatus::Cancelled;
                            current.ended_at = Some(now);
                            current.failure_reason = Some(reason);
                            store::reservations::update(tx, &current).await?;
                        }
                        Ok(())
                    })
                })
                .await?;
            queue_accounting::recompute_for_gpu_type(&self.store, &gpu_type).await?;
        }
        Ok(())
    }

    /// Appends an out-of-memory kill event to a reservation's log when the pod's recent
    /// events mention one. Purely observational; does not change reservation status.
    async fn detect_oom(&self, now: DateTime<Utc>) -> Result<()> {
        let active = store::reservations::list_by_status(self.store.pool(), ReservationStatus::Active).await?;

        for reservation in active {
            let Some(sandbox_name) = reservation.sandbox_name.clone() else { continue };
            let namespace = reservation.sandbox_namespace.clone().unwrap_or_else(|| self.sandbox_namespace.clone());

            let events = match self.cluster.pod_events(&namespace, &sandbox_name).await {
                Ok(events) => events,
                Err(error) => {
                    tracing::debug!(%error, reservation = %reservation.id, "could not read pod events");
                    continue;
                }
            };

            let oom_events: Vec<_> = events.iter().filter(|e| e.reason.eq_ignore_ascii_case("OOMKilling") || e.reason.eq_ignore_ascii_case("OOMKilled")).collect();
            if oom_events.is_empty() {
                continue;
            }

            let already_logged = reservation.events.iter().any(|e| e.message.contains("OOM"));
            if already_logged {
                continue;
            }

            self.store
                .with_tx(|tx| {
                    let id = reservation.id;
                    let now = now;
                    Box::pin(async move {
                        let mut current = store::reservations::get_for_update(tx, id).await?;
                        if current.status == ReservationStatus::Active {
                            current.events.push(ReservationEvent { at: now, message: "Container was OOM-killed".to_string() });
                            store::reservations::update(tx, &current).await?;
                        }
                        Ok(())
                    })
                })
                .await?;
        }

        Ok(())
    }

    /// Retains only the `retention_count` most recent completed snapshots per disk,
    /// deleting the rest from the cloud, and syncs the disk's pending/completed counters
    /// against the cloud's own snapshot lifecycle state.
    async fn snapshot_housekeeping(&self, retention_count: u32) -> Result<()> {
        let disks = store::disks::list_all(self.store.pool()).await?;

        for disk in disks {
            if disk.soft_deleted_at.is_some() {
                continue;
            }

            let snapshots = match retry::with_retry(3, || self.storage.list_snapshots(vec![])).await {
                Ok(s) => s,
                Err(error) => {
                    tracing::warn!(%error, disk = %disk.id, "could not list snapshots");
                    continue;
                }
            };

            let mut of_this_disk: Vec<_> = snapshots.into_iter().filter(|s| s.volume_id == disk.volume_id).collect();
            of_this_disk.sort_by_key(|s| s.started_at);

            let pending = of_this_disk.iter().filter(|s| s.lifecycle == SnapshotLifecycle::Pending).count() as u32;
            let completed: Vec<_> = of_this_disk.iter().filter(|s| s.lifecycle == SnapshotLifecycle::Completed).collect();

            if completed.len() as u32 > retention_count {
                let excess = completed.len() - retention_count as usize;
                for stale in &completed[..excess] {
                    if let Err(error) = retry::with_retry(3, || self.storage.delete_snapshot(&stale.id)).await {
                        tracing::warn!(%error, snapshot = %stale.id, "failed to prune old snapshot");
                    }
                }
            }

            let latest_completed = completed.last().map(|s| s.id.clone());
            if disk.pending_snapshot_count != pending || disk.completed_snapshot_count != completed.len() as u32 || disk.last_snapshot_id != latest_completed {
                self.store
                    .with_tx(|tx| {
                        let mut updated = disk.clone();
                        let latest_completed = latest_completed.clone();
                        Box::pin(async move {
                            updated.pending_snapshot_count = pending;
                            updated.completed_snapshot_count = completed.len() as u32;
                            updated.last_snapshot_id = latest_completed;
                            store::disks::update(tx, &updated).await
                        })
                    })
                    .await?;
            }
        }

        Ok(())
    }

    /// Hard-deletes disks that have sat soft-deleted past the retention window, removing
    /// the backing cloud volume first so the store row only disappears once the cloud side
    /// is actually gone.
    async fn purge_expired_disks(&self, retention_days: u32) -> Result<()> {
        let candidates = store::disks::list_past_retention(self.store.pool(), retention_days as i32).await?;

        for disk in candidates {
            if disk.in_use {
                continue;
            }
            match retry::with_retry(3, || self.storage.delete_volume(&disk.volume_id)).await {
                Ok(()) => {}
                Err(error) if matches!(error, cluster_adapter::Error::NotFound { .. }) => {}
                Err(error) => {
                    tracing::warn!(%error, disk = %disk.id, "failed to delete cloud volume, will retry next tick");
                    continue;
                }
            }

            self.store
                .with_tx(|tx| {
                    let id = disk.id;
                    Box::pin(async move { store::disks::hard_delete(tx, id).await })
                })
                .await?;
        }

        Ok(())
    }
}
