//! Process configuration recognised by the processor, tracker and sweeper.
//! Every field is overridable; defaults are documented and match what a deployment that
//! sets nothing should actually behave like.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration shared by all three agents. Each binary's `StructOpt` CLI args populate
/// this struct (see `agents::config::CliArgs`) so the defaults below are the single source
/// of truth; the CLI only adds `--flag` plumbing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    pub queue_name: String,
    pub poll_interval_seconds: u64,
    pub visibility_timeout_seconds: u64,
    pub batch_size: usize,
    pub warning_minutes: Vec<u64>,
    pub grace_period_seconds: u64,
    pub max_reservation_hours: f64,
    pub default_duration_hours: f64,
    pub per_user_active_cap: u32,
    pub multi_node_cap_nodes: u32,
    pub snapshot_retention_count: u32,
    pub soft_delete_retention_days: u32,
    pub cpu_slots_per_node: u32,
    pub tick_period_seconds: u64,
    pub stuck_preparing_minutes: u64,
    pub stuck_queued_minutes: u64,
    pub extension_hours: f64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            queue_name: "gpu_reservations".to_string(),
            poll_interval_seconds: 5,
            visibility_timeout_seconds: 900,
            batch_size: 1,
            warning_minutes: vec![30, 15, 5],
            grace_period_seconds: 120,
            max_reservation_hours: 48.0,
            default_duration_hours: 4.0,
            per_user_active_cap: 2,
            multi_node_cap_nodes: 4,
            snapshot_retention_count: 10,
            soft_delete_retention_days: 30,
            cpu_slots_per_node: 3,
            tick_period_seconds: 300,
            stuck_preparing_minutes: 15,
            stuck_queued_minutes: 15,
            extension_hours: 24.0,
        }
    }
}

impl ProcessConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_seconds)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_seconds)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_secs(self.tick_period_seconds)
    }

    /// Largest configured warning level (default 30).
    pub fn largest_warning_minutes(&self) -> u64 {
        self.warning_minutes.iter().copied().max().unwrap_or(30)
    }

    /// The stricter of the configured cap and the 48h single-extension ceiling: an operator
    /// who lowers `max_reservation_hours` below 48 means it, and one who raises it above 48
    /// still only gets the single-extension policy the state machine enforces elsewhere.
    /// See DESIGN.md "extend handler" for the write-up.
    pub fn effective_max_reservation_hours(&self) -> f64 {
        self.max_reservation_hours.min(48.0)
    }
}
