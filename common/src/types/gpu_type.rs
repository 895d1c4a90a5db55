use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Static, operator-configured row for one supported GPU tag (e.g. `t4`, `a100`, `h100`),
/// plus the dynamic availability columns the availability tracker refreshes every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuType {
    pub tag: String,
    pub instance_family: String,
    pub gpus_per_node: u32,
    pub cpu_per_node: u32,
    pub memory_gb_per_node: u32,
    pub active: bool,
    /// Types that may span multiple fully-free nodes in a single reservation.
    pub multi_node_capable: bool,

    pub total_gpus: u32,
    pub available_gpus: u32,
    pub max_reservable: u32,
    pub full_nodes_available: u32,
    pub running_instances: u32,
    pub last_updated_at: Option<DateTime<Utc>>,
    pub updated_by: Option<String>,
}

impl GpuType {
    /// CPU-only "types" track user slots rather than GPUs: each node hosts a fixed number
    /// of reservations and `max_reservable` is always 1.
    pub fn is_cpu_only(&self) -> bool {
        self.gpus_per_node == 0
    }

    /// A tick's freshness row is stale once it hasn't been refreshed for more than one
    /// cadence interval: a liveness alarm, not a hard failure.
    pub fn is_stale(&self, now: DateTime<Utc>, tick_period_seconds: u64) -> bool {
        match self.last_updated_at {
            Some(at) => (now - at).num_seconds() > tick_period_seconds as i64,
            None => true,
        }
    }
}
