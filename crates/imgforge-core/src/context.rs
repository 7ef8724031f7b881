//! Cooperative cancellation + deadline, shared by the vsock client, the
//! orchestrator's worker body, and the event stream (spec §5).
//!
//! Deliberately minimal: a [`tokio::sync::watch`] channel for "cancel now"
//! plus a [`tokio::time::Instant`] deadline. Cleanup paths that must run
//! regardless of why the build context ended (volume/VM teardown) use
//! [`BuildContext::detached`], which never cancels and never expires.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

/// A cancellable, deadline-bound context threaded through one build's
/// execution. Cloning shares the same cancellation signal; the deadline is
/// copied by value since it never changes after construction.
#[derive(Clone)]
pub struct BuildContext {
    cancel_rx: watch::Receiver<bool>,
    deadline: Instant,
}

/// The cancel half, held by whoever owns the build (the orchestrator) and
/// never handed to collaborators. Cloning shares the same signal, so the
/// orchestrator can stash one in a lookup table while another copy cancels it.
#[derive(Clone)]
pub struct BuildContextHandle {
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl BuildContext {
    /// A context that cancels on `handle.cancel()` and expires after
    /// `timeout`.
    pub fn with_timeout(timeout: Duration) -> (Self, BuildContextHandle) {
        let (tx, rx) = watch::channel(false);
        let ctx = Self {
            cancel_rx: rx,
            deadline: Instant::now() + timeout,
        };
        (ctx, BuildContextHandle { cancel_tx: Arc::new(tx) })
    }

    /// A context that never cancels and never expires (for cleanup paths
    /// that must run even when the owning build context was cancelled).
    pub fn detached() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self {
            cancel_rx: rx,
            // ~136 years out; long enough to be "never" for any build.
            deadline: Instant::now() + Duration::from_secs(60 * 60 * 24 * 365 * 100),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once the context is cancelled. Never resolves for a
    /// detached context.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
        // Sender dropped without ever cancelling: hang forever, matching
        // a detached context's "never cancels" contract.
        std::future::pending::<()>().await;
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Resolves once the deadline passes. Never resolves for a detached
    /// context within any realistic build lifetime.
    pub async fn expired(&self) {
        tokio::time::sleep_until(self.deadline).await;
    }
}

impl BuildContextHandle {
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}
