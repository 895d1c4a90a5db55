//! Availability tracker: every tick, computes per-GPU-type capacity/schedulability from
//! live cluster telemetry and reconciles the persistent-disk table against the cloud's
//! volume inventory.

use crate::{naming, retry};
use chrono::Utc;
use cluster_adapter::{ClusterCompute, CloudStorage, Node, VolumeLifecycle, VolumeState};
use common_lib::errors::Result;
use common_lib::types::{Disk, GpuType};
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

pub struct Tracker {
    store: store::Store,
    cluster: Arc<dyn ClusterCompute>,
    storage: Arc<dyn CloudStorage>,
    identity: String,
    sandbox_namespace: String,
}

impl Tracker {
    pub fn new(
        store: store::Store,
        cluster: Arc<dyn ClusterCompute>,
        storage: Arc<dyn CloudStorage>,
        identity: impl Into<String>,
        sandbox_namespace: impl Into<String>,
    ) -> Self {
        Self { store, cluster, storage, identity: identity.into(), sandbox_namespace: sandbox_namespace.into() }
    }

    #[tracing::instrument(skip(self))]
    pub async fn tick(&self, cpu_slots_per_node: u32, multi_node_cap_nodes: u32) {
        if let Err(error) = self.compute_availability(cpu_slots_per_node, multi_node_cap_nodes).await {
            tracing::error!(%error, "availability computation failed this tick");
        }
        if let Err(error) = self.reconcile_disks().await {
            tracing::error!(%error, "disk reconciliation failed this tick");
        }
    }

    async fn compute_availability(&self, cpu_slots_per_node: u32, multi_node_cap_nodes: u32) -> Result<()> {
        let gpu_types = store::gpu_types::list_active(self.store.pool()).await?;
        let nodes = retry::with_retry(3, || self.cluster.list_nodes()).await?;
        let pods = retry::with_retry(3, || self.cluster.list_pods(&self.sandbox_namespace, "")).await?;

        let mut requested_by_node: BTreeMap<String, u32> = BTreeMap::new();
        let mut slots_by_node: BTreeMap<String, u32> = BTreeMap::new();
        for pod in &pods {
            if let Some(node) = &pod.node_name {
                *requested_by_node.entry(node.clone()).or_insert(0) += pod.requested_gpus;
                *slots_by_node.entry(node.clone()).or_insert(0) += 1;
            }
        }

        for gpu_type in &gpu_types {
            let candidate_nodes: Vec<&Node> = nodes
                .iter()
                .filter(|n| n.ready && n.schedulable)
                .filter(|n| n.labels.get(naming::GPU_TYPE_LABEL_KEY).map(|v| v == &gpu_type.tag).unwrap_or(false))
                .collect();

            let (total, available, max_reservable, full_nodes, running_instances) = if gpu_type.is_cpu_only() {
                Self::cpu_only_availability(&candidate_nodes, &slots_by_node, cpu_slots_per_node)
            } else {
                Self::gpu_availability(gpu_type, &candidate_nodes, &requested_by_node, multi_node_cap_nodes)
            };

            self.store
                .with_tx(|tx| {
                    let tag = gpu_type.tag.clone();
                    let identity = self.identity.clone();
                    Box::pin(async move {
                        store::gpu_types::upsert_availability(tx, &tag, total, available, max_reservable, full_nodes, running_instances, &identity).await
                    })
                })
                .await?;
        }

        Ok(())
    }

    /// GPU-bearing type: total/available GPUs summed across ready nodes, full nodes are
    /// those with none of their GPUs currently requested, max-reservable follows the
    /// multi-node-capable vs. single-node formula.
    fn gpu_availability(
        gpu_type: &GpuType,
        candidate_nodes: &[&Node],
        requested_by_node: &BTreeMap<String, u32>,
        multi_node_cap_nodes: u32,
    ) -> (u32, u32, u32, u32, u32) {
        let total: u32 = candidate_nodes.iter().map(|n| n.advertised_gpus).sum();
        let mut available = 0u32;
        let mut full_nodes = 0u32;
        let mut max_single_node_free = 0u32;

        for node in candidate_nodes {
            let used = *requested_by_node.get(&node.name).unwrap_or(&0);
            let free = node.advertised_gpus.saturating_sub(used);
            available += free;
            if free == node.advertised_gpus && node.advertised_gpus > 0 {
                full_nodes += 1;
            }
            max_single_node_free = max_single_node_free.max(free);
        }

        let max_reservable = if gpu_type.multi_node_capable {
            (full_nodes * gpu_type.gpus_per_node).min(multi_node_cap_nodes * gpu_type.gpus_per_node)
        } else {
            max_single_node_free
        };

        let running_instances: u32 = requested_by_node.values().copied().filter(|n| *n > 0).count() as u32;
        (total, available, max_reservable, full_nodes, running_instances)
    }

    /// CPU-only "type": tracks user slots rather than GPUs. Each node hosts a fixed number
    /// of reservations; max-reservable is always 1 once any node has a free slot.
    fn cpu_only_availability(candidate_nodes: &[&Node], slots_by_node: &BTreeMap<String, u32>, cpu_slots_per_node: u32) -> (u32, u32, u32, u32, u32) {
        let total = candidate_nodes.len() as u32 * cpu_slots_per_node;
        let mut available = 0u32;
        let mut full_nodes = 0u32;
        let mut running_instances = 0u32;

        for node in candidate_nodes {
            let used = *slots_by_node.get(&node.name).unwrap_or(&0);
            available += cpu_slots_per_node.saturating_sub(used);
            running_instances += used;
            if used == 0 {
                full_nodes += 1;
            }
        }

        let max_reservable = if available > 0 { 1 } else { 0 };
        (total, available, max_reservable, full_nodes, running_instances)
    }

    /// Converges the disk table toward the cloud's volume inventory - the cloud is the
    /// single source of truth for volumes. Each volume is reconciled in its own transaction
    /// with bounded retry so one rate-limited call doesn't stall the rest.
    async fn reconcile_disks(&self) -> Result<()> {
        let volumes = retry::with_retry(5, || {
            self.storage.list_volumes(vec![(naming::GPU_DEV_TAG_KEY.to_string(), naming::GPU_DEV_TAG_VALUE.to_string())])
        })
        .await?;

        let store_disks = store::disks::list_all(self.store.pool()).await?;
        let mut by_volume_id: BTreeMap<String, Vec<Disk>> = BTreeMap::new();
        for disk in store_disks {
            by_volume_id.entry(disk.volume_id.clone()).or_default().push(disk);
        }

        for volume in &volumes {
            if let Err(error) = self.reconcile_one_volume(volume, by_volume_id.get(&volume.id)).await {
                tracing::error!(%error, volume = %volume.id, "failed to reconcile volume, will retry next tick");
            }
        }

        // Volumes present in the store but no longer in the cloud's tagged inventory are
        // soft-deleted; a duplicate id with the freshest `last_reconciled_at` wins and the
        // rest are left for an operator to investigate (warned, not auto-removed).
        let seen: std::collections::BTreeSet<&str> = volumes.iter().map(|v| v.id.as_str()).collect();
        for (volume_id, rows) in &by_volume_id {
            if seen.contains(volume_id.as_str()) {
                continue;
            }
            let mut rows = rows.clone();
            rows.sort_by_key(|d| d.last_reconciled_at);
            if rows.len() > 1 {
                tracing::warn!(volume_id, count = rows.len(), "duplicate store rows for the same volume id");
            }
            if let Some(newest) = rows.last() {
                if newest.soft_deleted_at.is_none() {
                    let mut updated = newest.clone();
                    updated.soft_deleted_at = Some(Utc::now());
                    self.store
                        .with_tx(|tx| {
                            let updated = updated.clone();
                            Box::pin(async move { store::disks::update(tx, &updated).await })
                        })
                        .await?;
                }
            }
        }

        Ok(())
    }

    async fn reconcile_one_volume(&self, volume: &VolumeState, existing: Option<&Vec<Disk>>) -> Result<()> {
        let now = Utc::now();
        match existing.and_then(|rows| rows.iter().max_by_key(|d| d.last_reconciled_at)) {
            Some(disk) => {
                let mut updated = disk.clone();
                updated.az = volume.az.clone();
                updated.size_gb = volume.size_gb;
                updated.in_use = matches!(volume.lifecycle, VolumeLifecycle::InUse);
                updated.soft_deleted_at = None;
                updated.last_reconciled_at = Some(now);
                self.store
                    .with_tx(|tx| {
                        let updated = updated.clone();
                        Box::pin(async move { store::disks::update(tx, &updated).await })
                    })
                    .await?;
            }
            None => {
                // Present in the cloud, absent from the store: import as an orphan owned
                // by whatever user tag the volume carries.
                let owner = volume.tags.get(naming::USER_TAG_KEY).cloned().unwrap_or_else(|| "unknown".to_string());
                let disk = Disk {
                    id: Uuid::new_v4(),
                    user: owner,
                    name: format!("imported-{}", &volume.id),
                    volume_id: volume.id.clone(),
                    az: volume.az.clone(),
                    size_gb: volume.size_gb,
                    in_use: matches!(volume.lifecycle, VolumeLifecycle::InUse),
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
                self.store
                    .with_tx(|tx| {
                        let disk = disk.clone();
                        Box::pin(async move { store::disks::insert(tx, &disk).await })
                    })
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, advertised_gpus: u32) -> Node {
        Node { name: name.to_string(), labels: BTreeMap::new(), ready: true, schedulable: true, advertised_gpus }
    }

    fn gpu_type(gpus_per_node: u32, multi_node_capable: bool) -> GpuType {
        GpuType {
            tag: "t4".to_string(),
            instance_family: "g4dn.xlarge".to_string(),
            gpus_per_node,
            cpu_per_node: 48,
            memory_gb_per_node: 192,
            active: true,
            multi_node_capable,
            total_gpus: 0,
            available_gpus: 0,
            max_reservable: 0,
            full_nodes_available: 0,
            running_instances: 0,
            last_updated_at: None,
            updated_by: None,
        }
    }

    /// Two T4 nodes at 4 GPUs each, one fully free, one 3/4 used.
    #[test]
    fn single_node_type_reports_max_reservable_as_the_freest_node() {
        let n1 = node("node-a", 4);
        let n2 = node("node-b", 4);
        let candidates = vec![&n1, &n2];
        let mut requested = BTreeMap::new();
        requested.insert("node-b".to_string(), 3);

        let gt = gpu_type(4, false);
        let (total, available, max_reservable, full_nodes, _running) = Tracker::gpu_availability(&gt, &candidates, &requested, 4);

        assert_eq!(total, 8);
        assert_eq!(available, 5);
        assert_eq!(full_nodes, 1);
        assert_eq!(max_reservable, 4);
    }

    #[test]
    fn multi_node_type_caps_at_four_full_nodes() {
        let nodes: Vec<Node> = (0..6).map(|i| node(&format!("node-{i}"), 8)).collect();
        let candidates: Vec<&Node> = nodes.iter().collect();
        let requested = BTreeMap::new();

        let gt = gpu_type(8, true);
        let (total, available, max_reservable, full_nodes, _running) = Tracker::gpu_availability(&gt, &candidates, &requested, 4);

        assert_eq!(total, 48);
        assert_eq!(available, 48);
        assert_eq!(full_nodes, 6);
        assert_eq!(max_reservable, 32); // capped at 4 nodes x 8 gpus, not 6 x 8
    }

    /// Boundary: a request for 0 GPUs against a CPU-only type is allowed and
    /// counts one user slot; max_reservable is 1 as long as any node has a free slot.
    #[test]
    fn cpu_only_type_tracks_slots_not_gpus() {
        let n1 = node("node-a", 0);
        let n2 = node("node-b", 0);
        let candidates = vec![&n1, &n2];
        let mut slots = BTreeMap::new();
        slots.insert("node-a".to_string(), 3);
        slots.insert("node-b".to_string(), 1);

        let (total, available, max_reservable, full_nodes, running) = Tracker::cpu_only_availability(&candidates, &slots, 3);

        assert_eq!(total, 6);
        assert_eq!(available, 2);
        assert_eq!(max_reservable, 1);
        assert_eq!(full_nodes, 0);
        assert_eq!(running, 4);
    }

    #[test]
    fn cpu_only_type_with_no_free_slots_reports_zero_max_reservable() {
        let n1 = node("node-a", 0);
        let candidates = vec![&n1];
        let mut slots = BTreeMap::new();
        slots.insert("node-a".to_string(), 3);

        let (_total, available, max_reservable, _full_nodes, _running) = Tracker::cpu_only_availability(&candidates, &slots, 3);

        assert_eq!(available, 0);
        assert_eq!(max_reservable, 0);
    }
}
