//! Cooperative shutdown for every loop a host runs.
//!
//! One [`ShutdownCoordinator`] owns the root cancellation token and tracks
//! the spawned loops. Each loop receives a [`ShutdownSignal`]: once it fires
//! the loop stops receiving and gives in-flight handlers up to the drain
//! timeout to finish.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

/// Default time in-flight handlers get to finish after shutdown is requested.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack on top of the drain timeout for loops to publish their final state.
const STOP_GRACE: Duration = Duration::from_secs(1);

/// Shutdown view handed to one loop.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    token: CancellationToken,
    drain_timeout: Duration,
}

impl ShutdownSignal {
    /// Wraps an existing token.
    pub fn new(token: CancellationToken, drain_timeout: Duration) -> Self {
        Self {
            token,
            drain_timeout,
        }
    }

    /// Resolves once shutdown has been requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    /// `true` once shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Time in-flight work gets after cancellation.
    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Underlying token.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Owns the root token and waits for spawned loops to stop.
#[derive(Debug, Clone)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
    tracker: TaskTracker,
    drain_timeout: Duration,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(DEFAULT_DRAIN_TIMEOUT)
    }
}

impl ShutdownCoordinator {
    pub fn new(drain_timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            tracker: TaskTracker::new(),
            drain_timeout,
        }
    }

    /// A signal tied to this coordinator. Cancelling the coordinator cancels
    /// every signal; a signal cannot cancel its siblings.
    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal::new(self.token.child_token(), self.drain_timeout)
    }

    /// Spawns a tracked task. [`shutdown`](Self::shutdown) waits for it.
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(future)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn drain_timeout(&self) -> Duration {
        self.drain_timeout
    }

    /// Requests shutdown and waits for every tracked task.
    ///
    /// Returns `false` if tasks were still running after the drain timeout
    /// plus a short grace period.
    pub async fn shutdown(&self) -> bool {
        info!(
            drain_timeout_ms = self.drain_timeout.as_millis() as u64,
            tasks = self.tracker.len(),
            "shutdown requested"
        );
        self.token.cancel();
        self.tracker.close();

        match tokio::time::timeout(self.drain_timeout + STOP_GRACE, self.tracker.wait()).await {
            Ok(()) => {
                info!("all loops stopped");
                true
            }
            Err(_) => {
                warn!(
                    remaining = self.tracker.len(),
                    "loops still running after drain timeout"
                );
                false
            }
        }
    }
}
