//! Tracing/telemetry bootstrap shared by the processor, tracker and sweeper binaries.

use opentelemetry::{global, sdk::trace, KeyValue};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

/// Initialise `tracing`, optionally exporting spans to a Jaeger agent.
///
/// `service_name` tags every emitted span; `tags` are attached as resource attributes
/// (handy for distinguishing replicas of the same binary); `jaeger` is the agent
/// endpoint, e.g. `localhost:6831` - when `None` only the stdout/fmt layer is installed.
pub fn init_tracing(service_name: &str, tags: Vec<KeyValue>, jaeger: Option<String>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer();

    let registry = tracing_subscriber::registry().with(filter).with(fmt_layer);

    match jaeger {
        Some(agent) => {
            let mut resource = vec![KeyValue::new("service.name", service_name.to_string())];
            resource.extend(tags);

            let tracer = opentelemetry_jaeger::new_agent_pipeline()
                .with_endpoint(agent)
                .with_service_name(service_name)
                .with_trace_config(trace::config().with_resource(opentelemetry::sdk::Resource::new(resource)))
                .install_batch(opentelemetry::runtime::Tokio)
                .expect("failed to install jaeger tracer");

            let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);
            let _ = tracing::subscriber::set_global_default(registry.with(otel_layer));
        }
        None => {
            let _ = tracing::subscriber::set_global_default(registry);
        }
    }
}

/// Parses a `key=value` pair used for `--tracing-tags key=value,key2=value2`.
pub fn parse_key_value(src: &str) -> Result<KeyValue, String> {
    match src.split_once('=') {
        Some((key, value)) => Ok(KeyValue::new(key.to_string(), value.to_string())),
        None => Err(format!("invalid key=value pair: '{}'", src)),
    }
}

/// Flushes any pending spans. Call on graceful shutdown.
pub fn flush() {
    global::shutdown_tracer_provider();
}
