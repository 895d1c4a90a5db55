//! Entry point for the reservation processor: dequeues and dispatches queue messages,
//! driving reservations through the state machine.

use agents::config::ProcessorArgs;
use agents::processor::Processor;
use cluster_adapter::ec2::Ec2Storage;
use cluster_adapter::k8s::K8sCompute;
use std::sync::Arc;
use structopt::StructOpt;

#[tokio::main]
async fn main() {
    let args = ProcessorArgs::from_args();
    args.common.init_tracing("reservation-processor");
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

    let processor = Processor::new(store, cluster, storage, args.process_config(), args.common.sandbox_namespace.clone());

    let shutdown = shutdown::Shutdown::new();
    let wait_sig = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { shutdown.wait_sig().await }
    });

    processor.run(shutdown).await;

    let _ = wait_sig.await;
    utils::tracing_telemetry::flush();
}
