use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

/// GPU counts a single reservation may request. Anything else is rejected at validation.
pub const ALLOWED_GPU_COUNTS: &[u32] = &[0, 1, 2, 4, 8, 16];

/// The reservation lifecycle state machine. Status advances monotonically except for
/// cancellation, which may be reached from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    Pending,
    Queued,
    Preparing,
    Active,
    Expired,
    Cancelled,
    Failed,
}

impl ReservationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Expired | Self::Cancelled | Self::Failed)
    }

    /// Statuses a cancel handler may act on; cancel is valid from any non-terminal state.
    pub fn is_cancellable(self) -> bool {
        !self.is_terminal()
    }
}

/// One of the 30/15/5-minute pre-expiry warnings the sweeper delivers into a live sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WarningLevel(pub u64);

/// A user-reachable endpoint published once the sandbox reaches `active`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshEndpoint {
    pub host: String,
    pub port: u16,
}

/// An event appended to a reservation's user-visible log (currently only OOM detections;
/// see `agents::sweeper::oom`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationEvent {
    pub at: DateTime<Utc>,
    pub message: String,
}

/// The central entity: a user's request for `gpu_count` GPUs of `gpu_type` for
/// `duration_hours`, and everything the control plane tracks while it lives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub user: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub duration_hours: f64,
    pub disk_name: Option<String>,
    pub no_persistent_disk: bool,
    pub docker_image: Option<String>,
    pub env: BTreeMap<String, String>,
    pub status: ReservationStatus,

    pub created_at: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,

    pub sandbox_name: Option<String>,
    pub sandbox_namespace: Option<String>,
    pub ssh_endpoint: Option<SshEndpoint>,

    pub queue_position: Option<u32>,
    pub eta_minutes: Option<u32>,

    pub failure_reason: Option<String>,
    pub warnings_sent: BTreeSet<u64>,
    pub extension_count: u32,
    pub collaborators: Vec<String>,
    pub events: Vec<ReservationEvent>,

    pub volume_id: Option<String>,
}

impl Reservation {
    pub fn new(
        id: Uuid,
        user: impl Into<String>,
        gpu_type: impl Into<String>,
        gpu_count: u32,
        duration_hours: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            user: user.into(),
            gpu_type: gpu_type.into(),
            gpu_count,
            duration_hours,
            disk_name: None,
            no_persistent_disk: false,
            docker_image: None,
            env: BTreeMap::new(),
            status: ReservationStatus::Pending,
            created_at: now,
            launched_at: None,
            ended_at: None,
            expires_at: None,
            sandbox_name: None,
            sandbox_namespace: None,
            ssh_endpoint: None,
            queue_position: None,
            eta_minutes: None,
            failure_reason: None,
            warnings_sent: BTreeSet::new(),
            extension_count: 0,
            collaborators: Vec::new(),
            events: Vec::new(),
            volume_id: None,
        }
    }

    /// Deterministic sandbox name, derived from the reservation id: redelivery of a
    /// `create` message must detect an already-provisioned sandbox rather than create a
    /// duplicate.
    pub fn sandbox_name_for(id: Uuid) -> String {
        format!("gpu-rsv-{id}")
    }

    pub fn minutes_to_expiry(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at.map(|exp| (exp - now).num_minutes())
    }
}

/// API-facing projection of a reservation. Distinct from the storage row so internal-only
/// fields (volume_id, raw event log) never leak across the adapter seam.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationView {
    pub id: Uuid,
    pub user: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub duration_hours: f64,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub ssh_host: Option<String>,
    pub ssh_port: Option<u16>,
    pub queue_position: Option<u32>,
    pub eta_minutes: Option<u32>,
    pub failure_reason: Option<String>,
    pub collaborators: Vec<String>,
    pub extension_count: u32,
}

impl From<&Reservation> for ReservationView {
    fn from(r: &Reservation) -> Self {
        Self {
            id: r.id,
            user: r.user.clone(),
            gpu_type: r.gpu_type.clone(),
            gpu_count: r.gpu_count,
            duration_hours: r.duration_hours,
            status: r.status,
            created_at: r.created_at,
            launched_at: r.launched_at,
            expires_at: r.expires_at,
            ended_at: r.ended_at,
            ssh_host: r.ssh_endpoint.as_ref().map(|e| e.host.clone()),
            ssh_port: r.ssh_endpoint.as_ref().map(|e| e.port),
            queue_position: r.queue_position,
            eta_minutes: r.eta_minutes,
            failure_reason: r.failure_reason.clone(),
            collaborators: r.collaborators.clone(),
            extension_count: r.extension_count,
        }
    }
}
