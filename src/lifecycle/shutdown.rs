//! Shutdown coordination.

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Coordinator for process-wide cancellation.
///
/// Every subscription pump, sink writer, and retry loop holds a token derived
/// from this one and is spawned on the shared tracker, so shutdown can both
/// stop them and wait for them to finish.
#[derive(Clone, Debug)]
pub struct Shutdown {
    token: CancellationToken,
    tracker: TaskTracker,
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// The process-wide token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// A token cancelled with the process, or earlier on its own.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Tracker for background tasks.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Trigger the shutdown signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Trigger shutdown and wait for every tracked task to exit.
    pub async fn shutdown(&self) {
        self.trigger();
        self.drain().await;
    }

    /// Wait for tracked tasks to exit without triggering cancellation.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Number of tracked tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
