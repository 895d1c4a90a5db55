//! Bounded exponential backoff for transient cluster/cloud errors, shared by the
//! processor's provisioning path and the tracker's disk reconciler.

use std::future::Future;

/// Default retry budget for a single cluster-adapter call before the error is surfaced to
/// the caller as permanent-for-now (the caller's own handler then decides whether that
/// means failing the reservation or leaving the message unacked for redelivery).
pub const DEFAULT_RETRY_BUDGET: u32 = 5;

/// Calls `f` until it succeeds or returns a non-retryable error, sleeping with jittered
/// backoff (`store::jittered_backoff`) between attempts. Retryable errors are retried up to
/// `max_attempts` times; the final attempt's error (retryable or not) is returned as-is.
pub async fn with_retry<F, Fut, T>(max_attempts: u32, mut f: F) -> cluster_adapter::Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = cluster_adapter::Result<T>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) if error.is_retryable() && attempt < max_attempts => {
                tokio::time::sleep(store::jittered_backoff(attempt)).await;
            }
            Err(error) => return Err(error),
        }
    }
}
