use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// API-facing disk status. Derived from the richer internal fields, never stored
/// redundantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DiskStatus {
    Available,
    InUse,
    Creating,
    Deleting,
    SoftDeleted,
}

/// A named, user-owned persistent block volume that can follow a user across
/// reservations, distinct from a sandbox's ephemeral scratch volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Disk {
    pub id: Uuid,
    pub user: String,
    pub name: String,
    pub volume_id: String,
    pub az: String,
    pub size_gb: u32,

    pub in_use: bool,
    pub in_use_by: Option<Uuid>,

    pub last_snapshot_id: Option<String>,
    pub pending_snapshot_count: u32,
    pub completed_snapshot_count: u32,

    pub creating: bool,
    pub deleting: bool,
    pub soft_deleted_at: Option<DateTime<Utc>>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Disk {
    pub fn status(&self) -> DiskStatus {
        if self.soft_deleted_at.is_some() {
            DiskStatus::SoftDeleted
        } else if self.deleting {
            DiskStatus::Deleting
        } else if self.creating {
            DiskStatus::Creating
        } else if self.in_use {
            DiskStatus::InUse
        } else {
            DiskStatus::Available
        }
    }

    /// A soft-deleted disk is retained this long before the cloud volume is actually
    /// removed (default from `ProcessConfig::soft_delete_retention_days`).
    pub fn past_retention(&self, now: DateTime<Utc>, retention_days: u32) -> bool {
        match self.soft_deleted_at {
            Some(at) => (now - at).num_days() >= retention_days as i64,
            None => false,
        }
    }
}

/// API-facing projection of a disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskView {
    pub id: Uuid,
    pub user: String,
    pub name: String,
    pub size_gb: u32,
    pub az: String,
    pub status: DiskStatus,
    pub in_use_by: Option<Uuid>,
    pub last_snapshot_id: Option<String>,
    pub snapshot_count: u32,
    pub pending_snapshot_count: u32,
    pub created_at: DateTime<Utc>,
    pub last_reconciled_at: Option<DateTime<Utc>>,
}

impl From<&Disk> for DiskView {
    fn from(d: &Disk) -> Self {
        Self {
            id: d.id,
            user: d.user.clone(),
            name: d.name.clone(),
            size_gb: d.size_gb,
            az: d.az.clone(),
            status: d.status(),
            in_use_by: d.in_use_by,
            last_snapshot_id: d.last_snapshot_id.clone(),
            snapshot_count: d.completed_snapshot_count,
            pending_snapshot_count: d.pending_snapshot_count,
            created_at: d.created_at,
            last_reconciled_at: d.last_reconciled_at,
        }
    }
}
