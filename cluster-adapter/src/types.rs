use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub ready: bool,
    pub schedulable: bool,
    /// GPUs advertised via the node's allocatable resources (0 for CPU-only nodes).
    pub advertised_gpus: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct PodEvent {
    pub reason: String,
    pub message: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub node_name: Option<String>,
    pub phase: PodPhase,
    pub requested_gpus: u32,
    pub start_time: Option<DateTime<Utc>>,
    pub labels: BTreeMap<String, String>,
}

/// Everything needed to materialize a reservation's sandbox pod.
#[derive(Debug, Clone)]
pub struct PodSpec {
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub gpu_count: u32,
    pub cpu_millis: Option<u32>,
    pub memory_mb: Option<u32>,
    pub node_names: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub env: BTreeMap<String, String>,
    pub ssh_public_keys: Vec<String>,
    pub volume: Option<VolumeMount>,
}

#[derive(Debug, Clone)]
pub struct VolumeMount {
    /// `None` means an ephemeral scratch volume rather than a persistent cloud volume.
    pub cloud_volume_id: Option<String>,
    pub mount_path: String,
}

#[derive(Debug, Clone)]
pub struct ServiceSpec {
    pub name: String,
    pub namespace: String,
    pub selector_labels: BTreeMap<String, String>,
    pub ssh_target_port: u16,
    pub extra_ports: Vec<(String, u16, u16)>,
}

#[derive(Debug, Clone)]
pub struct ServiceRef {
    pub name: String,
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct VolumeRef {
    pub id: String,
    pub az: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeLifecycle {
    Creating,
    Available,
    InUse,
    Deleting,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct VolumeState {
    pub id: String,
    pub az: String,
    pub size_gb: u32,
    pub lifecycle: VolumeLifecycle,
    pub attached_to: Option<String>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SnapshotRef {
    pub id: String,
    pub volume_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotLifecycle {
    Pending,
    Completed,
    Error,
}

#[derive(Debug, Clone)]
pub struct SnapshotState {
    pub id: String,
    pub volume_id: String,
    pub lifecycle: SnapshotLifecycle,
    pub started_at: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}
