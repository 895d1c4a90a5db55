//! AWS EC2/EBS-backed [`CloudStorage`]: volumes and snapshots for persistent disks.

use crate::error::{Error, Result};
use crate::types::{SnapshotLifecycle, SnapshotRef, SnapshotState, VolumeLifecycle, VolumeRef, VolumeState};
use crate::CloudStorage;
use async_trait::async_trait;
use aws_sdk_ec2::types::{Filter, ResourceType, Tag, TagSpecification, VolumeState as AwsVolumeState};
use aws_sdk_ec2::Client;
use std::collections::BTreeMap;

/// Every volume/snapshot this control plane owns carries this tag; the availability
/// tracker's disk reconciler ignores anything without it - a cloud volume missing its
/// gpu-dev tag isn't ours.
pub const OWNERSHIP_TAG: &str = "gpu-dev";

pub struct Ec2Storage {
    client: Client,
}

impl Ec2Storage {
    pub async fn from_env() -> Self {
        let config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        Self { client: Client::new(&config) }
    }

    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn classify(op: &str, e: impl std::fmt::Display, retryable: bool) -> Error {
        if retryable {
            Error::Transient { operation: op.to_string(), reason: e.to_string() }
        } else {
            Error::Permanent { operation: op.to_string(), reason: e.to_string() }
        }
    }

    fn tag_specs(resource: ResourceType, tags: &[(String, String)]) -> TagSpecification {
        let mut builder = TagSpecification::builder().resource_type(resource);
        builder = builder.tags(Tag::builder().key(OWNERSHIP_TAG).value("true").build());
        for (k, v) in tags {
            builder = builder.tags(Tag::builder().key(k).value(v).build());
        }
        builder.build()
    }
}

fn volume_lifecycle(state: &AwsVolumeState) -> VolumeLifecycle {
    match state {
        AwsVolumeState::Creating => VolumeLifecycle::Creating,
        AwsVolumeState::Available => VolumeLifecycle::Available,
        AwsVolumeState::InUse => VolumeLifecycle::InUse,
        AwsVolumeState::Deleting => VolumeLifecycle::Deleting,
        AwsVolumeState::Deleted => VolumeLifecycle::Deleted,
        AwsVolumeState::Error => VolumeLifecycle::Deleted,
        _ => VolumeLifecycle::Available,
    }
}

#[async_trait]
impl CloudStorage for Ec2Storage {
    async fn create_volume(
        &self,
        size_gb: u32,
        az: &str,
        tags: Vec<(String, String)>,
        snapshot_id: Option<String>,
    ) -> Result<VolumeRef> {
        let mut req = self
            .client
            .create_volume()
            .availability_zone(az)
            .size(size_gb as i32)
            .volume_type(aws_sdk_ec2::types::VolumeType::Gp3)
            .tag_specifications(Self::tag_specs(ResourceType::Volume, &tags));
        if let Some(snap) = snapshot_id {
            req = req.snapshot_id(snap);
        }
        let out = req.send().await.map_err(|e| Self::classify("create_volume", e, true))?;
        let id = out.volume_id().ok_or_else(|| Error::Permanent {
            operation: "create_volume".to_string(),
            reason: "response missing volume id".to_string(),
        })?;
        Ok(VolumeRef { id: id.to_string(), az: az.to_string() })
    }

    async fn delete_volume(&self, id: &str) -> Result<()> {
        match self.client.delete_volume().volume_id(id).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("InvalidVolume.NotFound") => Ok(()),
            Err(e) => Err(Self::classify("delete_volume", e, true)),
        }
    }

    async fn describe_volume(&self, id: &str) -> Result<VolumeState> {
        let out = self
            .client
            .describe_volumes()
            .volume_ids(id)
            .send()
            .await
            .map_err(|e| Self::classify("describe_volume", e, true))?;
        let v = out.volumes().first().ok_or_else(|| Error::NotFound { what: "volume".to_string(), id: id.to_string() })?;
        Ok(VolumeState {
            id: v.volume_id().unwrap_or_default().to_string(),
            az: v.availability_zone().unwrap_or_default().to_string(),
            size_gb: v.size().unwrap_or(0) as u32,
            lifecycle: v.state().map(volume_lifecycle).unwrap_or(VolumeLifecycle::Available),
            attached_to: v.attachments().first().and_then(|a| a.instance_id()).map(str::to_string),
            tags: v.tags().iter().filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string()))).collect::<BTreeMap<_, _>>(),
        })
    }

    async fn list_volumes(&self, tag_filter: Vec<(String, String)>) -> Result<Vec<VolumeState>> {
        let mut req = self.client.describe_volumes();
        for (k, v) in &tag_filter {
            req = req.filters(Filter::builder().name(format!("tag:{k}")).values(v).build());
        }
        let out = req.send().await.map_err(|e| Self::classify("list_volumes", e, true))?;
        Ok(out
            .volumes()
            .iter()
            .map(|v| VolumeState {
                id: v.volume_id().unwrap_or_default().to_string(),
                az: v.availability_zone().unwrap_or_default().to_string(),
                size_gb: v.size().unwrap_or(0) as u32,
                lifecycle: v.state().map(volume_lifecycle).unwrap_or(VolumeLifecycle::Available),
                attached_to: v.attachments().first().and_then(|a| a.instance_id()).map(str::to_string),
                tags: v.tags().iter().filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string()))).collect::<BTreeMap<_, _>>(),
            })
            .collect())
    }

    async fn create_snapshot(&self, volume_id: &str, tags: Vec<(String, String)>) -> Result<SnapshotRef> {
        let out = self
            .client
            .create_snapshot()
            .volume_id(volume_id)
            .tag_specifications(Self::tag_specs(ResourceType::Snapshot, &tags))
            .send()
            .await
            .map_err(|e| Self::classify("create_snapshot", e, true))?;
        let id = out.snapshot_id().ok_or_else(|| Error::Permanent {
            operation: "create_snapshot".to_string(),
            reason: "response missing snapshot id".to_string(),
        })?;
        Ok(SnapshotRef { id: id.to_string(), volume_id: volume_id.to_string() })
    }

    async fn list_snapshots(&self, filter: Vec<(String, String)>) -> Result<Vec<SnapshotState>> {
        let mut req = self.client.describe_snapshots().owner_ids("self");
        for (k, v) in &filter {
            req = req.filters(Filter::builder().name(format!("tag:{k}")).values(v).build());
        }
        let out = req.send().await.map_err(|e| Self::classify("list_snapshots", e, true))?;
        Ok(out
            .snapshots()
            .iter()
            .map(|s| SnapshotState {
                id: s.snapshot_id().unwrap_or_default().to_string(),
                volume_id: s.volume_id().unwrap_or_default().to_string(),
                lifecycle: match s.state() {
                    Some(aws_sdk_ec2::types::SnapshotState::Completed) => SnapshotLifecycle::Completed,
                    Some(aws_sdk_ec2::types::SnapshotState::Error) => SnapshotLifecycle::Error,
                    _ => SnapshotLifecycle::Pending,
                },
                started_at: s
                    .start_time()
                    .and_then(|t| chrono::DateTime::from_timestamp(t.secs(), 0))
                    .unwrap_or_else(chrono::Utc::now),
                tags: s.tags().iter().filter_map(|t| Some((t.key()?.to_string(), t.value()?.to_string()))).collect::<BTreeMap<_, _>>(),
            })
            .collect())
    }

    async fn delete_snapshot(&self, id: &str) -> Result<()> {
        match self.client.delete_snapshot().snapshot_id(id).send().await {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("InvalidSnapshot.NotFound") => Ok(()),
            Err(e) => Err(Self::classify("delete_snapshot", e, true)),
        }
    }
}
