//! Entry point for the availability tracker: periodically recomputes per-GPU-type capacity
//! and reconciles the persistent-disk table against the cloud's volume inventory.

use agents::config::TrackerArgs;
use agents::tracker::Tracker;
use cluster_adapter::ec2::Ec2Storage;
use cluster_adapter::k8s::K8sCompute;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

#[tokio::main]
async fn main() {
    let args = TrackerArgs::from_args();
    args.common.init_tracing("availability-tracker");
    utils::print_package_info!();

    let store = store::Store::connect(&args.common.database_url, args.common.max_db_connections)
        .await
        .expect("failed to connect to the store");
    let cluster = Arc::new(
        K8sCompute::from_default_context(args.common.sandbox_namespace.clone())
            .await
            .expect("failed to initialise the cluster adapter"),
    );
    let storage = Arc::new(Ec2Storage::from_env().await);

    let identity = std::env::var("HOSTNAME").unwrap_or_else(|_| format!("tracker-{}", uuid::Uuid::new_v4()));
    let cfg = args.process_config();
    let tracker = Tracker::new(store, cluster, storage, identity, args.common.sandbox_namespace.clone());

    let shutdown = shutdown::Shutdown::new();
    let wait_sig = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.wait_sig().await }
    });

    agents::poller::run_periodic(
        "availability-tracker",
        cfg.tick_period(),
        Duration::from_secs(600),
        shutdown,
        || tracker.tick(cfg.cpu_slots_per_node, cfg.multi_node_cap_nodes),
    )
    .await;

    let _ = wait_sig.await;
    utils::tracing_telemetry::flush();
}
