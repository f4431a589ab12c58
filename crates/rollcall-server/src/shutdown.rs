//! Graceful shutdown coordination via `CancellationToken`.
//!
//! One token fans out to the broker feed, the heartbeat sweep, the HTTP
//! listener and every session task.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default timeout for graceful shutdown before abandoning tasks.
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Coordinates graceful shutdown across all server tasks.
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Get a clone of the cancellation token.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Initiate shutdown.
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    /// Whether a shutdown has been initiated.
    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel every task and wait up to `timeout` for `handles` to finish.
    ///
    /// Tasks still running after the timeout are aborted. Returns `true`
    /// when everything finished in time.
    pub async fn graceful_shutdown(
        &self,
        handles: Vec<JoinHandle<()>>,
        timeout: Option<Duration>,
    ) -> bool {
        let timeout = timeout.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT);

        self.shutdown();
        info!(
            task_count = handles.len(),
            timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            "waiting for tasks to complete"
        );

        let aborters: Vec<_> = handles.iter().map(JoinHandle::abort_handle).collect();
        let drain = futures::future::join_all(handles);

        if tokio::time::timeout(timeout, drain).await.is_err() {
            warn!("shutdown timed out after {timeout:?}, aborting remaining tasks");
            for handle in aborters {
                handle.abort();
            }
            return false;
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
