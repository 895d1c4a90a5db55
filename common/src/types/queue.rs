use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// The nine message kinds a queue message may carry. Unknown kinds deserialize to
/// `Unknown` rather than failing, so forward-compatible messages are logged and acked
/// instead of poisoning the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Create,
    Cancel,
    Extend,
    EnableInteractive,
    DisableInteractive,
    AddUser,
    RebuildImage,
    DiskCreate,
    DiskDelete,
}

/// A dequeued row. `payload` is kind-specific and parsed by the relevant handler; the
/// processor itself only needs `kind` to dispatch and `reservation_id`/`disk_id` to know
/// which row is the subject.
///
/// `kind` is kept as the raw string from the wire rather than `MessageKind` directly: a
/// kind this binary doesn't recognise (a newer producer, a future message type) must still
/// round-trip through the store so it can be logged and acked rather than rejected at the
/// deserialization layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: i64,
    pub kind: String,
    pub reservation_id: Option<Uuid>,
    pub disk_id: Option<Uuid>,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: u32,
}

impl QueueMessage {
    /// `None` for a kind this binary doesn't recognise; callers log and ack rather than
    /// treat it as an error.
    pub fn kind(&self) -> Option<MessageKind> {
        self.kind.parse().ok()
    }
}

/// Request payload for `create`; the allocate/provision pipeline reads everything else off
/// the reservation row itself - a `create` message carries no business state beyond the id.
///
/// `confirmed_disk_reassign` is the one exception: set by the (out of scope) API after a
/// user confirms a warning prompt that the named disk is currently in use by another
/// reservation. The processor re-reads disk state fresh on every delivery rather than
/// caching the first read's verdict, so a disk that became free between deliveries is
/// picked up correctly without needing this flag at all.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CreatePayload {
    #[serde(default)]
    pub confirmed_disk_reassign: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExtendPayload {
    pub additional_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AddUserPayload {
    pub username: Option<String>,
    pub ssh_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RebuildImagePayload {
    pub docker_image: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiskDeletePayload {}

/// Request payload for a standalone `disk-create` (a user pre-creating a persistent disk
/// outside of any reservation). `size_gb`/`az` fall back to platform defaults when absent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DiskCreatePayload {
    pub user: String,
    pub name: String,
    pub size_gb: Option<u32>,
    pub az: Option<String>,
}
