//! imgforge-queue: bounded-concurrency FIFO build queue (spec §4.D).
//!
//! The queue owns pending entries exclusively: dispatch wraps the caller's
//! start closure so completion — on *every* exit path — frees the active
//! slot and promotes the oldest pending entry. The orchestrator hands the
//! queue an already-bound closure (a "what to do" capability), so the
//! queue itself never needs to know about volumes, VMs, or vsock.

use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use imgforge_core::BuildRequest;
use tokio::sync::Mutex;
use tracing::instrument;

/// A boxed, one-shot unit of work the queue runs when a build is promoted
/// to active. Carries whatever capabilities it needs via captured state —
/// the queue never inspects it.
pub type StartFn = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

struct PendingEntry {
    id: String,
    #[allow(dead_code)] // captured for introspection parity with spec's Queue Entry
    request: BuildRequest,
    start_fn: Option<StartFn>,
}

struct Inner {
    active: HashSet<String>,
    pending: VecDeque<PendingEntry>,
}

/// Bounded-concurrency FIFO queue with dedup, cancel, and position
/// introspection. All mutating operations take the single exclusive lock;
/// dispatch happens outside the lock so a worker starting up never blocks
/// another caller's `enqueue`/`cancel`/`position`.
pub struct BuildQueue {
    max_concurrent: usize,
    inner: Mutex<Inner>,
}

impl BuildQueue {
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            max_concurrent,
            inner: Mutex::new(Inner {
                active: HashSet::new(),
                pending: VecDeque::new(),
            }),
        })
    }

    /// Enqueue `id`. Returns its queue position: `0` if it is now (or
    /// already was) active, otherwise its 1-based pending position.
    /// Re-enqueuing an id already active or pending is a no-op beyond
    /// reporting its position — it never produces a second execution.
    #[instrument(skip_all, fields(build_id = %id))]
    pub async fn enqueue(self: &Arc<Self>, id: String, request: BuildRequest, start_fn: StartFn) -> usize {
        let mut inner = self.inner.lock().await;

        if inner.active.contains(&id) {
            return 0;
        }
        if let Some(pos) = inner.pending.iter().position(|e| e.id == id) {
            return pos + 1;
        }

        if inner.active.len() < self.max_concurrent {
            inner.active.insert(id.clone());
            drop(inner);
            self.dispatch(id, start_fn);
            0
        } else {
            inner.pending.push_back(PendingEntry {
                id,
                request,
                start_fn: Some(start_fn),
            });
            inner.pending.len()
        }
    }

    fn dispatch(self: &Arc<Self>, id: String, start_fn: StartFn) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            start_fn().await;
            queue.complete(&id).await;
        });
    }

    /// Called by the wrapped start closure on every exit path: frees the
    /// active slot and promotes the oldest pending entry, if capacity and
    /// a pending entry both exist.
    async fn complete(self: &Arc<Self>, id: &str) {
        let mut inner = self.inner.lock().await;
        inner.active.remove(id);
        if inner.active.len() < self.max_concurrent {
            if let Some(mut next) = inner.pending.pop_front() {
                let start_fn = next.start_fn.take().expect("pending entry always holds a start_fn");
                inner.active.insert(next.id.clone());
                drop(inner);
                self.dispatch(next.id, start_fn);
            }
        }
    }

    /// Cancel a pending build. Returns `false` without effect if `id` is
    /// active (callers that need to stop a running build must go through
    /// the orchestrator, which owns the VM handle) or absent; `true` if it
    /// was pending and has been removed.
    pub async fn cancel(&self, id: &str) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.active.contains(id) {
            return false;
        }
        if let Some(pos) = inner.pending.iter().position(|e| e.id == id) {
            inner.pending.remove(pos);
            true
        } else {
            false
        }
    }

    /// `None` if `id` is active or unknown to the queue; otherwise its
    /// 1-based position in the pending list.
    pub async fn position(&self, id: &str) -> Option<usize> {
        let inner = self.inner.lock().await;
        if inner.active.contains(id) {
            return None;
        }
        inner.pending.iter().position(|e| e.id == id).map(|i| i + 1)
    }

    /// Read-only snapshot of queue depth for operator-facing introspection.
    pub async fn snapshot(&self) -> (Vec<String>, Vec<String>) {
        let inner = self.inner.lock().await;
        (
            inner.active.iter().cloned().collect(),
            inner.pending.iter().map(|e| e.id.clone()).collect(),
        )
    }
}
