//! Entry point for the expiry sweeper: warnings, expiry, stuck-state failover, OOM
//! detection and snapshot/disk retention housekeeping.

use agents::config::SweeperArgs;
use agents::sweeper::Sweeper;
use cluster_adapter::ec2::Ec2Storage;
use cluster_adapter::k8s::K8sCompute;
use std::sync::Arc;
use std::time::Duration;
use structopt::StructOpt;

#[tokio::main]
async fn main() {
    let args = SweeperArgs::from_args();
    args.common.init_tracing("expiry-sweeper");
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

    let cfg = args.process_config();
    let sweeper = Sweeper::new(store, cluster, storage, args.common.sandbox_namespace.clone());

    let shutdown = shutdown::Shutdown::new();
    let wait_sig = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.wait_sig().await }
    });

    agents::poller::run_periodic("expiry-sweeper", cfg.tick_period(), Duration::from_secs(600), shutdown, || sweeper.tick(&cfg)).await;

    let _ = wait_sig.await;
    utils::tracing_telemetry::flush();
}
