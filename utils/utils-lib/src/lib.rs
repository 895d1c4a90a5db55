//! Small set of helpers shared by every binary in the reservation control plane:
//! version/build info macros and tracing-telemetry bootstrap.

pub mod tracing_telemetry;

/// Default cadence for the availability tracker and expiry sweeper.
pub const DEFAULT_TICK_PERIOD: &str = "5m";
/// Default long-poll interval used while waiting on the queue.
pub const DEFAULT_POLL_INTERVAL: &str = "5s";

/// Expands to `"<pkg name> <pkg description>"`, used as the `StructOpt` app name.
#[macro_export]
macro_rules! package_description {
    () => {
        concat!(env!("CARGO_PKG_NAME"), " - ", env!("CARGO_PKG_DESCRIPTION"))
    };
}

/// Expands to the crate version, used as the `StructOpt` app version.
#[macro_export]
macro_rules! version_info_str {
    () => {
        env!("CARGO_PKG_VERSION")
    };
}

/// Prints package name and version to stdout on process startup.
#[macro_export]
macro_rules! print_package_info {
    () => {
        println!("{} v{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    };
}
