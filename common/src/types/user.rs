use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The core treats the user as an opaque identifier; authentication lives at the (out of
/// scope) API boundary. This type exists so the store has somewhere to record the handful
/// of columns the core itself reads (active reservation count enforcement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// An API key record. The core never inspects the secret; the (out of scope) API front
/// end is solely responsible for authenticating requests before they are enqueued.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub username: String,
    pub key_hash: String,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}
