//! Shared shape for the availability tracker and expiry sweeper: a periodic tick that
//! forbids overlapping runs of itself and is bounded by a hard per-tick deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Guards a periodic job against running concurrently with itself. A tick still in
/// progress when the next one is due is skipped rather than queued.
#[derive(Clone)]
pub struct RunGuard(Arc<AtomicBool>);

impl Default for RunGuard {
    fn default() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }
}

impl RunGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` if a previous tick is still running; otherwise a handle that releases the
    /// guard on drop, including on panic/early return.
    pub fn try_enter(&self) -> Option<RunGuardHandle> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| RunGuardHandle(self.0.clone()))
    }
}

pub struct RunGuardHandle(Arc<AtomicBool>);

impl Drop for RunGuardHandle {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runs `tick` on `period` until shutdown is signalled. Skips an invocation outright if the
/// previous one is still running, and logs (rather than propagates) a tick that overruns
/// `hard_timeout`.
pub async fn run_periodic<F, Fut>(
    job_name: &'static str,
    period: Duration,
    hard_timeout: Duration,
    shutdown: shutdown::Shutdown,
    mut tick: F,
) where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let guard = RunGuard::new();
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // The first tick fires immediately; skip it so a restart doesn't hammer the cluster.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.signalled() => {
                tracing::info!(job = job_name, "shutting down");
                return;
            }
        }

        let Some(_permit) = guard.try_enter() else {
            tracing::warn!(job = job_name, "previous tick still running, skipping this one");
            continue;
        };

        if tokio::time::timeout(hard_timeout, tick()).await.is_err() {
            tracing::error!(job = job_name, "tick exceeded its hard deadline");
        }
    }
}
