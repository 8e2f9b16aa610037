//! Interrupt coordination.
//!
//! A [`ShutdownCoordinator`] is shared between the Ctrl-C listener and the
//! orchestrator. Requesting shutdown stops dispatch and aborts the
//! in-flight batch; the last saved checkpoint stays as it is.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;
use tracing::warn;

/// Shared handle to a shutdown coordinator.
pub type SharedShutdown = Arc<ShutdownCoordinator>;

/// Broadcasts a one-shot shutdown request to any number of waiters.
#[derive(Debug, Default)]
pub struct ShutdownCoordinator {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownCoordinator {
    /// Creates a coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a coordinator wrapped in [`Arc`].
    #[must_use]
    pub fn shared() -> SharedShutdown {
        Arc::new(Self::new())
    }

    /// Requests shutdown. Waiters are woken exactly once.
    pub fn request_shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            self.notify.notify_waiters();
        }
    }

    /// Whether shutdown was requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once shutdown is requested; immediately if it already was.
    pub async fn wait_for_shutdown(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        // Register before checking the flag so a request in between is not lost.
        notified.as_mut().enable();
        if self.is_shutdown_requested() {
            return;
        }
        notified.await;
    }

    /// Requests shutdown on the first Ctrl-C.
    pub fn listen_for_ctrl_c(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let shutdown = Arc::clone(self);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after discarding the current batch");
                shutdown.request_shutdown();
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_returns_immediately_when_already_requested() {
        let shutdown = ShutdownCoordinator::new();
        shutdown.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), shutdown.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_waiters_are_woken() {
        let shutdown = ShutdownCoordinator::shared();
        let waiter = {
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move { shutdown.wait_for_shutdown().await })
        };
        tokio::task::yield_now().await;
        assert!(!shutdown.is_shutdown_requested());
        shutdown.request_shutdown();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert!(shutdown.is_shutdown_requested());
    }
}
