//! Facade over the container orchestrator and cloud block-storage APIs.
//!
//! This is the only crate in the workspace that knows the concrete vendor: [`k8s`] talks
//! to Kubernetes via `kube`, [`ec2`] talks to AWS EC2/EBS via `aws-sdk-ec2`. Every other
//! crate depends only on the [`ClusterCompute`] and [`CloudStorage`] traits, so swapping
//! either adapter (a different cloud, or the in-memory [`mock`] emulator used in tests)
//! requires no change anywhere else.

pub mod ec2;
mod error;
pub mod k8s;
pub mod mock;
mod types;

pub use error::{Error, Result};
pub use types::*;

use async_trait::async_trait;

/// Compute half of the facade: nodes, pods, services, and writing files into a live pod
/// (used by the sweeper to deliver expiry warning markers).
#[async_trait]
pub trait ClusterCompute: Send + Sync {
    async fn list_nodes(&self) -> Result<Vec<Node>>;
    async fn list_pods(&self, namespace: &str, selector: &str) -> Result<Vec<Pod>>;
    async fn pod_events(&self, namespace: &str, pod_name: &str) -> Result<Vec<PodEvent>>;
    async fn create_pod(&self, spec: PodSpec) -> Result<()>;
    async fn delete_pod(&self, name: &str, namespace: &str, grace_seconds: u32) -> Result<()>;
    async fn create_service(&self, spec: ServiceSpec) -> Result<ServiceRef>;
    async fn delete_service(&self, name: &str, namespace: &str) -> Result<()>;
    async fn write_file_in_pod(&self, namespace: &str, pod: &str, path: &str, bytes: &[u8]) -> Result<()>;
}

/// Storage half of the facade: cloud block volumes and snapshots.
#[async_trait]
pub trait CloudStorage: Send + Sync {
    async fn create_volume(
        &self,
        size_gb: u32,
        az: &str,
        tags: Vec<(String, String)>,
        snapshot_id: Option<String>,
    ) -> Result<VolumeRef>;
    async fn delete_volume(&self, id: &str) -> Result<()>;
    async fn describe_volume(&self, id: &str) -> Result<VolumeState>;
    async fn list_volumes(&self, tag_filter: Vec<(String, String)>) -> Result<Vec<VolumeState>>;
    async fn create_snapshot(&self, volume_id: &str, tags: Vec<(String, String)>) -> Result<SnapshotRef>;
    async fn list_snapshots(&self, filter: Vec<(String, String)>) -> Result<Vec<SnapshotState>>;
    async fn delete_snapshot(&self, id: &str) -> Result<()>;
}
