//! In-memory emulator of both adapter traits, used by the agents test suite. Deliberately
//! simple: enough state to drive the processor/tracker/sweeper through realistic scenarios
//! without a real cluster or cloud account.

use crate::error::{Error, Result};
use crate::types::*;
use crate::{ClusterCompute, CloudStorage};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;

#[derive(Default)]
struct State {
    nodes: Vec<Node>,
    pods: BTreeMap<(String, String), Pod>,
    pod_events: BTreeMap<(String, String), Vec<PodEvent>>,
    services: BTreeMap<(String, String), ServiceRef>,
    written_files: BTreeMap<(String, String, String), Vec<u8>>,
    volumes: BTreeMap<String, VolumeState>,
    snapshots: BTreeMap<String, SnapshotState>,
    next_id: u64,
}

/// A fake cluster + cloud, shared behind an `Arc` by tests that need to assert on state a
/// handler mutated (e.g. "was the pod actually created").
pub struct MockAdapter {
    state: Mutex<State>,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self { state: Mutex::new(State::default()) }
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&self, node: Node) {
        self.state.lock().nodes.push(node);
    }

    pub fn pod_exists(&self, namespace: &str, name: &str) -> bool {
        self.state.lock().pods.contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub fn service_exists(&self, namespace: &str, name: &str) -> bool {
        self.state.lock().services.contains_key(&(namespace.to_string(), name.to_string()))
    }

    pub fn written_file(&self, namespace: &str, pod: &str, path: &str) -> Option<Vec<u8>> {
        self.state.lock().written_files.get(&(namespace.to_string(), pod.to_string(), path.to_string())).cloned()
    }

    pub fn push_pod_event(&self, namespace: &str, pod: &str, event: PodEvent) {
        self.state.lock().pod_events.entry((namespace.to_string(), pod.to_string())).or_default().push(event);
    }

    fn next_id(state: &mut State) -> u64 {
        state.next_id += 1;
        state.next_id
    }
}

#[async_trait]
impl ClusterCompute for MockAdapter {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state.lock().nodes.clone())
    }

    async fn list_pods(&self, namespace: &str, _selector: &str) -> Result<Vec<Pod>> {
        Ok(self.state.lock().pods.values().filter(|p| p.namespace == namespace).cloned().collect())
    }

    async fn pod_events(&self, namespace: &str, pod_name: &str) -> Result<Vec<PodEvent>> {
        Ok(self.state.lock().pod_events.get(&(namespace.to_string(), pod_name.to_string())).cloned().unwrap_or_default())
    }

    async fn create_pod(&self, spec: PodSpec) -> Result<()> {
        let mut state = self.state.lock();
        let key = (spec.namespace.clone(), spec.name.clone());
        if state.pods.contains_key(&key) {
            return Ok(());
        }
        state.pods.insert(
            key,
            Pod {
                name: spec.name,
                namespace: spec.namespace,
                node_name: spec.node_names.first().cloned(),
                phase: PodPhase::Running,
                requested_gpus: spec.gpu_count,
                start_time: Some(chrono::Utc::now()),
                labels: spec.labels,
            },
        );
        Ok(())
    }

    async fn delete_pod(&self, name: &str, namespace: &str, _grace_seconds: u32) -> Result<()> {
        self.state.lock().pods.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn create_service(&self, spec: ServiceSpec) -> Result<ServiceRef> {
        let mut state = self.state.lock();
        let key = (spec.namespace.clone(), spec.name.clone());
        if let Some(existing) = state.services.get(&key) {
            return Ok(existing.clone());
        }
        let port = 30000 + (Self::next_id(&mut state) % 2768) as u16;
        let reference = ServiceRef { name: spec.name.clone(), host: format!("{}.{}.svc.cluster.local", spec.name, spec.namespace), port };
        state.services.insert(key, reference.clone());
        Ok(reference)
    }

    async fn delete_service(&self, name: &str, namespace: &str) -> Result<()> {
        self.state.lock().services.remove(&(namespace.to_string(), name.to_string()));
        Ok(())
    }

    async fn write_file_in_pod(&self, namespace: &str, pod: &str, path: &str, bytes: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.pods.contains_key(&(namespace.to_string(), pod.to_string())) {
            return Err(Error::NotFound { what: "pod".to_string(), id: pod.to_string() });
        }
        state.written_files.insert((namespace.to_string(), pod.to_string(), path.to_string()), bytes.to_vec());
        Ok(())
    }
}

#[async_trait]
impl CloudStorage for MockAdapter {
    async fn create_volume(&self, size_gb: u32, az: &str, tags: Vec<(String, String)>, snapshot_id: Option<String>) -> Result<VolumeRef> {
        let mut state = self.state.lock();
        let id = format!("vol-{:08x}", Self::next_id(&mut state));
        state.volumes.insert(
            id.clone(),
            VolumeState {
                id: id.clone(),
                az: az.to_string(),
                size_gb,
                lifecycle: VolumeLifecycle::Available,
                attached_to: None,
                tags: tags.into_iter().chain(std::iter::once(("gpu-dev".to_string(), "true".to_string()))).collect(),
            },
        );
        let _ = snapshot_id;
        Ok(VolumeRef { id, az: az.to_string() })
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        self.state.lock().volumes.remove(id);
        Ok(())
    }

    async fn describe_volume(&self, id: &str) -> Result<VolumeState> {
        self.state.lock().volumes.get(id).cloned().ok_or_else(|| Error::NotFound { what: "volume".to_string(), id: id.to_string() })
    }

    async fn list_volumes(&self, tag_filter: Vec<(String, String)>) -> Result<Vec<VolumeState>> {
        Ok(self
            .state
            .lock()
            .volumes
            .values()
            .filter(|v| tag_filter.iter().all(|(k, val)| v.tags.get(k) == Some(val)))
            .cloned()
            .collect())
    }

    async fn create_snapshot(&self, volume_id: &str, tags: Vec<(String, String)>) -> Result<SnapshotRef> {
        let mut state = self.state.lock();
        let id = format!("snap-{:08x}", Self::next_id(&mut state));
        state.snapshots.insert(
            id.clone(),
            SnapshotState {
                id: id.clone(),
                volume_id: volume_id.to_string(),
                lifecycle: SnapshotLifecycle::Completed,
                started_at: chrono::Utc::now(),
                tags: tags.into_iter().collect(),
            },
        );
        Ok(SnapshotRef { id, volume_id: volume_id.to_string() })
    }

    async fn list_snapshots(&self, filter: Vec<(String, String)>) -> Result<Vec<SnapshotState>> {
        Ok(self
            .state
            .lock()
            .snapshots
            .values()
            .filter(|s| filter.iter().all(|(k, val)| s.tags.get(k) == Some(val)))
            .cloned()
            .collect())
    }

    async fn delete_snapshot(&self, id: &str) -> Result<()> {
        self.state.lock().snapshots.remove(id);
        Ok(())
    }
}
