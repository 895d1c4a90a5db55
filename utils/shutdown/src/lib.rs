//! Cooperative shutdown signal shared by the processor, tracker and sweeper loops.
//!
//! Each binary spawns its main loop alongside [`Shutdown::wait_sig`]; when SIGTERM/SIGINT
//! arrives, in-flight work finishes its current iteration (one message, one tick) and the
//! loop exits instead of being killed mid-transaction.

use lazy_static::lazy_static;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;

lazy_static! {
    static ref REQUESTED: AtomicBool = AtomicBool::new(false);
}

/// A cloneable shutdown handle. Every clone observes the same signal.
#[derive(Clone)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(1);
        Self { tx }
    }

    /// True once a shutdown has been requested; cheap enough to check every loop iteration.
    pub fn is_requested() -> bool {
        REQUESTED.load(Ordering::SeqCst)
    }

    /// Waits for SIGTERM or SIGINT, then marks shutdown requested and notifies waiters.
    pub async fn wait_sig(&self) {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(s) => s,
            Err(error) => {
                tracing::error!(%error, "failed to install SIGTERM handler");
                return;
            }
        };

        tokio::select! {
            _ = term.recv() => tracing::info!("received SIGTERM"),
            _ = tokio::signal::ctrl_c() => tracing::info!("received SIGINT"),
        }

        REQUESTED.store(true, Ordering::SeqCst);
        let _ = self.tx.send(());
    }

    /// A future that resolves once shutdown has been signalled; select! this against
    /// in-flight work to cancel it promptly.
    pub async fn signalled(&self) {
        if Self::is_requested() {
            return;
        }
        let mut rx = self.tx.subscribe();
        let _ = rx.recv().await;
    }
}
