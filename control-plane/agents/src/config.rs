//! `StructOpt` CLI args shared by the three binaries, mapping 1:1 onto
//! `common_lib::config::ProcessConfig`'s fields so a deployment that sets nothing still
//! gets exactly the documented defaults.

use common_lib::config::ProcessConfig;
use opentelemetry::KeyValue;
use structopt::StructOpt;

/// Flags every binary accepts: where the store lives, which queue to use, and tracing
/// bootstrap. Binary-specific flags (poll cadence, tick cadence, grace periods...) are
/// declared on each binary's own `CliArgs` via `#[structopt(flatten)]`.
#[derive(Debug, StructOpt)]
pub struct CommonArgs {
    /// Postgres connection string for the relational store.
    #[structopt(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Connection pool size.
    #[structopt(long, default_value = "10")]
    pub max_db_connections: u32,

    /// Embedded queue name (spec default `gpu_reservations`).
    #[structopt(long, default_value = "gpu_reservations")]
    pub queue_name: String,

    /// Namespace user sandboxes are created in.
    #[structopt(long, default_value = "gpu-sandboxes")]
    pub sandbox_namespace: String,

    /// Add process service tags to emitted traces.
    #[structopt(long, env = "TRACING_TAGS", value_delimiter = ",", parse(try_from_str = utils::tracing_telemetry::parse_key_value))]
    pub tracing_tags: Vec<KeyValue>,

    /// Trace to a Jaeger agent at this address instead of stdout only.
    #[structopt(long)]
    pub jaeger: Option<String>,
}

impl CommonArgs {
    pub fn init_tracing(&self, service_name: &str) {
        utils::tracing_telemetry::init_tracing(service_name, self.tracing_tags.clone(), self.jaeger.clone());
    }
}

/// `processor` binary's flags; batch size, poll interval and visibility timeout drive the
/// dequeue loop directly.
#[derive(Debug, StructOpt)]
#[structopt(name = utils::package_description!(), version = utils::version_info_str!())]
pub struct ProcessorArgs {
    #[structopt(flatten)]
    pub common: CommonArgs,

    #[structopt(long, default_value = "5")]
    pub poll_interval_seconds: u64,

    #[structopt(long, default_value = "900")]
    pub visibility_timeout_seconds: u64,

    #[structopt(long, default_value = "1")]
    pub batch_size: usize,

    #[structopt(long, default_value = "48")]
    pub max_reservation_hours: f64,

    #[structopt(long, default_value = "24")]
    pub extension_hours: f64,

    #[structopt(long, default_value = "2")]
    pub per_user_active_cap: u32,

    #[structopt(long, default_value = "4")]
    pub multi_node_cap_nodes: u32,

    #[structopt(long, default_value = "3")]
    pub cpu_slots_per_node: u32,
}

impl ProcessorArgs {
    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            queue_name: self.common.queue_name.clone(),
            poll_interval_seconds: self.poll_interval_seconds,
            visibility_timeout_seconds: self.visibility_timeout_seconds,
            batch_size: self.batch_size,
            max_reservation_hours: self.max_reservation_hours,
            extension_hours: self.extension_hours,
            per_user_active_cap: self.per_user_active_cap,
            multi_node_cap_nodes: self.multi_node_cap_nodes,
            cpu_slots_per_node: self.cpu_slots_per_node,
            ..ProcessConfig::default()
        }
    }
}

/// `tracker` binary's flags; the tick period is the only cadence it needs.
#[derive(Debug, StructOpt)]
#[structopt(name = utils::package_description!(), version = utils::version_info_str!())]
pub struct TrackerArgs {
    #[structopt(flatten)]
    pub common: CommonArgs,

    #[structopt(long, default_value = "300")]
    pub tick_period_seconds: u64,

    #[structopt(long, default_value = "3")]
    pub cpu_slots_per_node: u32,

    #[structopt(long, default_value = "4")]
    pub multi_node_cap_nodes: u32,
}

impl TrackerArgs {
    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            queue_name: self.common.queue_name.clone(),
            tick_period_seconds: self.tick_period_seconds,
            cpu_slots_per_node: self.cpu_slots_per_node,
            multi_node_cap_nodes: self.multi_node_cap_nodes,
            ..ProcessConfig::default()
        }
    }
}

/// `sweeper` binary's flags.
#[derive(Debug, StructOpt)]
#[structopt(name = utils::package_description!(), version = utils::version_info_str!())]
pub struct SweeperArgs {
    #[structopt(flatten)]
    pub common: CommonArgs,

    #[structopt(long, default_value = "300")]
    pub tick_period_seconds: u64,

    #[structopt(long, default_value = "120")]
    pub grace_period_seconds: u64,

    #[structopt(long, default_value = "30,15,5", value_delimiter = ",")]
    pub warning_minutes: Vec<u64>,

    #[structopt(long, default_value = "10")]
    pub snapshot_retention_count: u32,

    #[structopt(long, default_value = "30")]
    pub soft_delete_retention_days: u32,

    #[structopt(long, default_value = "15")]
    pub stuck_preparing_minutes: u64,

    #[structopt(long, default_value = "15")]
    pub stuck_queued_minutes: u64,
}

impl SweeperArgs {
    pub fn process_config(&self) -> ProcessConfig {
        ProcessConfig {
            queue_name: self.common.queue_name.clone(),
            tick_period_seconds: self.tick_period_seconds,
            grace_period_seconds: self.grace_period_seconds,
            warning_minutes: self.warning_minutes.clone(),
            snapshot_retention_count: self.snapshot_retention_count,
            soft_delete_retention_days: self.soft_delete_retention_days,
            stuck_preparing_minutes: self.stuck_preparing_minutes,
            stuck_queued_minutes: self.stuck_queued_minutes,
            ..ProcessConfig::default()
        }
    }
}
