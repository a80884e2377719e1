use std::future::Future;
use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::error;

/// Joinable set of background tasks tied to one cancellation scope.
///
/// Panics inside a task are caught and logged so one broken handler cannot take the
/// process down. `shutdown` cancels the scope and returns once every task has exited.
#[derive(Clone, Debug)]
pub struct Workers {
    name: &'static str,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl Workers {
    pub fn new(name: &'static str, cancel: CancellationToken) -> Self {
        Self {
            name,
            tracker: TaskTracker::new(),
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Spawns `fut`, or drops it unstarted when the scope is already shutting down.
    pub fn spawn<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return false;
        }
        let name = self.name;
        self.tracker.spawn(async move {
            if let Err(panic) = AssertUnwindSafe(fut).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                error!(
                    target = "rpc_webrtc::workers",
                    workers = name,
                    panic = %message,
                    "background task panicked"
                );
            }
        });
        true
    }

    /// Spawns `fut` and abandons it as soon as the scope is cancelled.
    pub fn spawn_cancellable<F>(&self, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cancel = self.cancel.clone();
        self.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = fut => {}
            }
        })
    }

    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Cancels, stops accepting new work and waits for running tasks.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Waits for running tasks without cancelling them.
    pub async fn join(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test_timeout::tokio_timeout_test]
    async fn shutdown_waits_for_cancelled_tasks() {
        let workers = Workers::new("test", CancellationToken::new());
        let finished = Arc::new(AtomicUsize::new(0));
        for _ in 0..4 {
            let token = workers.cancel_token().clone();
            let finished = finished.clone();
            workers.spawn(async move {
                token.cancelled().await;
                finished.fetch_add(1, Ordering::SeqCst);
            });
        }
        workers.shutdown().await;
        assert_eq!(finished.load(Ordering::SeqCst), 4);
        assert!(workers.is_empty());
        assert!(!workers.spawn(async {}));
    }

    #[test_timeout::tokio_timeout_test]
    async fn panics_are_contained() {
        let workers = Workers::new("test", CancellationToken::new());
        workers.spawn(async {
            panic!("handler blew up");
        });
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = ran.clone();
        workers.spawn(async move {
            ran_clone.fetch_add(1, Ordering::SeqCst);
        });
        workers.join().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
