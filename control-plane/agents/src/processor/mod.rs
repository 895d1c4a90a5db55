//! Reservation processor: dequeues one message at a time and drives the reservation state
//! machine. Every handler re-reads the subject row under `FOR UPDATE` before acting, so
//! redelivery (at-least-once queue semantics) converges rather than double-applies.

mod create;
mod disk_ops;
mod lifecycle;
mod sandbox_ops;

use crate::{naming, queue_accounting, retry};
use chrono::Utc;
use cluster_adapter::{ClusterCompute, CloudStorage, Node, PodSpec, VolumeMount};
use common_lib::errors::Result;
use common_lib::types::{GpuType, MessageKind, QueueMessage};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct Processor {
    store: store::Store,
    cluster: Arc<dyn ClusterCompute>,
    storage: Arc<dyn CloudStorage>,
    cfg: common_lib::config::ProcessConfig,
    sandbox_namespace: String,
}

impl Processor {
    pub fn new(
        store: store::Store,
        cluster: Arc<dyn ClusterCompute>,
        storage: Arc<dyn CloudStorage>,
        cfg: common_lib::config::ProcessConfig,
        sandbox_namespace: impl Into<String>,
    ) -> Self {
        Self { store, cluster, storage, cfg, sandbox_namespace: sandbox_namespace.into() }
    }

    /// Dequeues and handles messages until shutdown is signalled. Each message is acked on
    /// success, left to redeliver on a retryable error, and acked-with-failure-recorded on
    /// a permanent one: the same "unknown kinds are logged and acked" rule extends
    /// naturally to "unrecoverable payloads are logged and acked".
    pub async fn run(&self, shutdown: shutdown::Shutdown) {
        loop {
            tokio::select! {
                _ = shutdown.signalled() => {
                    tracing::info!("processor shutting down");
                    return;
                }
                messages = store::queue::dequeue(
                    self.store.pool(),
                    &self.cfg.queue_name,
                    self.cfg.batch_size as i64,
                    self.cfg.visibility_timeout_seconds as i64,
                ) => {
                    match messages {
                        Ok(messages) if messages.is_empty() => {
                            tokio::select! {
                                _ = tokio::time::sleep(self.cfg.poll_interval()) => {}
                                _ = shutdown.signalled() => return,
                            }
                        }
                        Ok(messages) => {
                            for message in messages {
                                self.dispatch(message).await;
                            }
                        }
                        Err(error) => {
                            tracing::error!(%error, "failed to dequeue, backing off");
                            tokio::time::sleep(self.cfg.poll_interval()).await;
                        }
                    }
                }
            }
        }
    }

    #[tracing::instrument(skip(self, message), fields(id = message.id, kind = %message.kind))]
    async fn dispatch(&self, message: QueueMessage) {
        let Some(kind) = message.kind() else {
            tracing::warn!(kind = %message.kind, "unrecognised message kind, acking");
            let _ = store::queue::ack(self.store.pool(), message.id).await;
            return;
        };

        let result = match kind {
            MessageKind::Create => create::handle(self, &message).await,
            MessageKind::Cancel => lifecycle::handle_cancel(self, &message).await,
            MessageKind::Extend => lifecycle::handle_extend(self, &message).await,
            MessageKind::EnableInteractive => sandbox_ops::handle_enable_interactive(self, &message).await,
            MessageKind::DisableInteractive => sandbox_ops::handle_disable_interactive(self, &message).await,
            MessageKind::AddUser => sandbox_ops::handle_add_user(self, &message).await,
            MessageKind::RebuildImage => sandbox_ops::handle_rebuild_image(self, &message).await,
            MessageKind::DiskCreate => disk_ops::handle_disk_create(self, &message).await,
            MessageKind::DiskDelete => disk_ops::handle_disk_delete(self, &message).await,
        };

        match result {
            Ok(()) => {
                let _ = store::queue::ack(self.store.pool(), message.id).await;
            }
            Err(error) if error.is_retryable() => {
                tracing::warn!(%error, "retryable error, leaving for redelivery");
            }
            Err(error) => {
                tracing::error!(%error, "permanent error, failing reservation and acking");
                if let Some(reservation_id) = message.reservation_id {
                    let _ = self.fail_reservation(reservation_id, error.user_message()).await;
                }
                let _ = store::queue::ack(self.store.pool(), message.id).await;
            }
        }
    }

    /// Marks a reservation terminally failed, unless it already reached a terminal state
    /// through some other path (e.g. the user cancelled it while this message was in
    /// flight).
    async fn fail_reservation(&self, reservation_id: uuid::Uuid, reason: String) -> Result<()> {
        let gpu_type = self
            .store
            .with_tx(|tx| {
                let reason = reason.clone();
                Box::pin(async move {
                    let mut current = store::reservations::get_for_update(tx, reservation_id).await?;
                    if current.status.is_terminal() {
                        return Ok(None);
                    }
                    current.status = common_lib::types::ReservationStatus::Failed;
                    current.ended_at = Some(Utc::now());
                    current.failure_reason = Some(reason);
                    let gpu_type = current.gpu_type.clone();
                    store::reservations::update(tx, &current).await?;
                    Ok(Some(gpu_type))
                })
            })
            .await?;

        if let Some(gpu_type) = gpu_type {
            queue_accounting::recompute_for_gpu_type(&self.store, &gpu_type).await?;
        }
        Ok(())
    }

    /// Picks the node(s) to place a reservation on from the live cluster state: best-fit on
    /// a single node when the request fits on one, or a set of fully-free nodes (picked
    /// lexicographically, capped at `multi_node_cap_nodes`) when it doesn't and the type
    /// allows spanning nodes. Returns `None` when there isn't enough free capacity right
    /// now - the caller queues instead of failing.
    async fn select_nodes(&self, gpu_type: &GpuType, gpu_count: u32) -> Result<Option<Vec<String>>> {
        let nodes = retry::with_retry(retry::DEFAULT_RETRY_BUDGET, || self.cluster.list_nodes()).await?;
        let pods = retry::with_retry(retry::DEFAULT_RETRY_BUDGET, || self.cluster.list_pods(&self.sandbox_namespace, "")).await?;

        let mut requested_by_node: BTreeMap<String, u32> = BTreeMap::new();
        let mut slots_by_node: BTreeMap<String, u32> = BTreeMap::new();
        for pod in &pods {
            if let Some(node) = &pod.node_name {
                *requested_by_node.entry(node.clone()).or_insert(0) += pod.requested_gpus;
                *slots_by_node.entry(node.clone()).or_insert(0) += 1;
            }
        }

        Ok(Self::select_nodes_from(
            &nodes,
            &requested_by_node,
            &slots_by_node,
            gpu_type,
            gpu_count,
            self.cfg.cpu_slots_per_node,
            self.cfg.multi_node_cap_nodes,
        ))
    }

    /// Pure node-selection rule, kept free of `self` so it can be exercised directly in
    /// unit tests without a live store.
    fn select_nodes_from(
        nodes: &[Node],
        requested_by_node: &BTreeMap<String, u32>,
        slots_by_node: &BTreeMap<String, u32>,
        gpu_type: &GpuType,
        gpu_count: u32,
        cpu_slots_per_node: u32,
        multi_node_cap_nodes: u32,
    ) -> Option<Vec<String>> {
        let candidates: Vec<&Node> = nodes
            .iter()
            .filter(|n| n.ready && n.schedulable)
            .filter(|n| n.labels.get(naming::GPU_TYPE_LABEL_KEY).map(|v| v == &gpu_type.tag).unwrap_or(false))
            .collect();

        if gpu_type.is_cpu_only() {
            let mut free: Vec<&Node> = candidates.into_iter().filter(|n| *slots_by_node.get(&n.name).unwrap_or(&0) < cpu_slots_per_node).collect();
            free.sort_by(|a, b| a.name.cmp(&b.name));
            return free.first().map(|n| vec![n.name.clone()]);
        }

        if gpu_count <= gpu_type.gpus_per_node {
            let mut fits: Vec<(u32, &Node)> = candidates
                .into_iter()
                .map(|n| (n.advertised_gpus.saturating_sub(*requested_by_node.get(&n.name).unwrap_or(&0)), n))
                .filter(|(free, _)| *free >= gpu_count)
                .collect();
            fits.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.name.cmp(&b.1.name)));
            return fits.first().map(|(_, n)| vec![n.name.clone()]);
        }

        if !gpu_type.multi_node_capable {
            return None;
        }

        let mut full: Vec<&Node> = candidates
            .into_iter()
            .filter(|n| n.advertised_gpus > 0 && *requested_by_node.get(&n.name).unwrap_or(&0) == 0)
            .collect();
        full.sort_by(|a, b| a.name.cmp(&b.name));
        let needed = (gpu_count as f64 / gpu_type.gpus_per_node as f64).ceil() as usize;
        let cap = multi_node_cap_nodes as usize;
        if needed > cap || full.len() < needed {
            return None;
        }
        Some(full.into_iter().take(needed).map(|n| n.name.clone()).collect())
    }

    fn pod_env(&self, requested: &BTreeMap<String, String>) -> BTreeMap<String, String> {
        requested.iter().filter(|(k, _)| !naming::ENV_DENYLIST.contains(&k.as_str())).map(|(k, v)| (k.clone(), v.clone())).collect()
    }

    fn build_pod_spec(
        &self,
        reservation: &common_lib::types::Reservation,
        node_names: Vec<String>,
        volume: Option<VolumeMount>,
    ) -> PodSpec {
        let mut labels = BTreeMap::new();
        labels.insert(naming::RESERVATION_LABEL_KEY.to_string(), reservation.id.to_string());
        labels.insert(naming::GPU_TYPE_LABEL_KEY.to_string(), reservation.gpu_type.clone());

        PodSpec {
            name: common_lib::types::Reservation::sandbox_name_for(reservation.id),
            namespace: reservation.sandbox_namespace.clone().unwrap_or_else(|| self.sandbox_namespace.clone()),
            image: reservation.docker_image.clone().unwrap_or_else(|| naming::DEFAULT_SANDBOX_IMAGE.to_string()),
            gpu_count: reservation.gpu_count,
            cpu_millis: None,
            memory_mb: None,
            node_names,
            labels,
            env: self.pod_env(&reservation.env),
            ssh_public_keys: Vec::new(),
            volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, advertised_gpus: u32) -> Node {
        Node { name: name.to_string(), labels: labels_for(advertised_gpus), ready: true, schedulable: true, advertised_gpus }
    }

    fn labels_for(advertised_gpus: u32) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(naming::GPU_TYPE_LABEL_KEY.to_string(), if advertised_gpus == 0 { "cpu".to_string() } else { "t4".to_string() });
        labels
    }

    fn gpu_type(tag: &str, gpus_per_node: u32, multi_node_capable: bool) -> GpuType {
        GpuType {
            tag: tag.to_string(),
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

    #[test]
    fn single_node_best_fit_picks_the_freest_node() {
        let n1 = node("node-a", 4);
        let n2 = node("node-b", 4);
        let mut requested = BTreeMap::new();
        requested.insert("node-a".to_string(), 2);
        let gt = gpu_type("t4", 4, false);

        let picked = Processor::select_nodes_from(&[n1, n2], &requested, &BTreeMap::new(), &gt, 2, 3, 4);

        assert_eq!(picked, Some(vec!["node-b".to_string()]));
    }

    #[test]
    fn single_node_tie_breaks_lexicographically_by_node_name() {
        let n1 = node("node-b", 4);
        let n2 = node("node-a", 4);
        let gt = gpu_type("t4", 4, false);

        let picked = Processor::select_nodes_from(&[n1, n2], &BTreeMap::new(), &BTreeMap::new(), &gt, 2, 3, 4);

        assert_eq!(picked, Some(vec!["node-a".to_string()]));
    }

    #[test]
    fn multi_node_request_spans_fully_free_nodes_up_to_the_cap() {
        let nodes: Vec<Node> = ["node-a", "node-b", "node-c"].iter().map(|n| node(n, 4)).collect();
        let gt = gpu_type("t4", 4, true);

        let picked = Processor::select_nodes_from(&nodes, &BTreeMap::new(), &BTreeMap::new(), &gt, 8, 3, 4);

        assert_eq!(picked, Some(vec!["node-a".to_string(), "node-b".to_string()]));
    }

    #[test]
    fn multi_node_request_exceeding_the_cap_is_none() {
        let nodes: Vec<Node> = ["node-a", "node-b", "node-c"].iter().map(|n| node(n, 4)).collect();
        let gt = gpu_type("t4", 4, true);

        let picked = Processor::select_nodes_from(&nodes, &BTreeMap::new(), &BTreeMap::new(), &gt, 16, 3, 2);

        assert_eq!(picked, None);
    }

    #[test]
    fn oversized_request_on_non_multi_node_type_is_none() {
        let n1 = node("node-a", 4);
        let gt = gpu_type("t4", 4, false);

        let picked = Processor::select_nodes_from(&[n1], &BTreeMap::new(), &BTreeMap::new(), &gt, 8, 3, 4);

        assert_eq!(picked, None);
    }

    #[test]
    fn cpu_only_type_picks_a_node_under_the_slot_cap() {
        let n1 = node("node-a", 0);
        let n2 = node("node-b", 0);
        let mut slots = BTreeMap::new();
        slots.insert("node-a".to_string(), 3);
        let gt = gpu_type("cpu", 0, false);

        let picked = Processor::select_nodes_from(&[n1, n2], &BTreeMap::new(), &slots, &gt, 1, 3, 4);

        assert_eq!(picked, Some(vec!["node-b".to_string()]));
    }

    #[test]
    fn cpu_only_type_with_all_nodes_full_is_none() {
        let n1 = node("node-a", 0);
        let mut slots = BTreeMap::new();
        slots.insert("node-a".to_string(), 3);
        let gt = gpu_type("cpu", 0, false);

        let picked = Processor::select_nodes_from(&[n1], &BTreeMap::new(), &slots, &gt, 1, 3, 4);

        assert_eq!(picked, None);
    }
}
