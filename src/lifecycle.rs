//! Process-wide shutdown flag and fetch-loop group.
//!
//! Every driver fetch loop is spawned through a [`Lifecycle`], which
//! tracks it like a wait group. Shutdown raises the flag, wakes all loops
//! through a cancellation token, and [`Lifecycle::wait`] returns once they
//! have all exited.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Default)]
struct Inner {
    shutting_down: AtomicBool,
    token: CancellationToken,
    tracker: TaskTracker,
}

/// Shared shutdown context. Cheap to clone.
#[derive(Clone, Default)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether shutdown has begun
    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    /// Token cancelled at shutdown; child tokens are handed to fetch loops
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }

    /// Resolves once shutdown has begun
    pub async fn cancelled(&self) {
        self.inner.token.cancelled().await
    }

    /// Spawn a task that shutdown will wait for
    pub fn spawn<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.inner.tracker.spawn(task)
    }

    /// Number of tracked tasks still running
    pub fn active_tasks(&self) -> usize {
        self.inner.tracker.len()
    }

    /// Raise the flag and wake every tracked loop
    pub fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        self.inner.token.cancel();
        self.inner.tracker.close();
    }

    /// Wait for every tracked task to exit. Call after [`shutdown`](Self::shutdown).
    pub async fn wait(&self) {
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }
}
