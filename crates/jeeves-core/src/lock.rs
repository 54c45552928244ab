use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::JeevesError;

/// How long a caller may wait to *acquire* the lock before failing with
/// [`JeevesError::AgentBusy`]. Execution time under the lock is unbounded.
pub const AGENT_LOCK_TIMEOUT: Duration = Duration::from_secs(180);

/// Process-wide single-flight primitive: at most one LLM turn executes at any
/// instant, across every trigger source (chat, cron, heartbeat).
///
/// Wraps a tokio mutex, whose lock queue is FIFO-fair, so concurrent callers
/// run in arrival order. Owned service object — construct once in the daemon
/// and thread clones through the scheduler and channel handlers.
#[derive(Clone)]
pub struct AgentLock {
    inner: Arc<tokio::sync::Mutex<()>>,
    acquire_timeout: Duration,
}

impl Default for AgentLock {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentLock {
    pub fn new() -> Self {
        Self::with_timeout(AGENT_LOCK_TIMEOUT)
    }

    /// Custom acquisition timeout (tests use short ones).
    pub fn with_timeout(acquire_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(tokio::sync::Mutex::new(())),
            acquire_timeout,
        }
    }

    /// Run `f` while holding the lock.
    ///
    /// Queued callers run to completion in FIFO order; the guard is released
    /// whether `f` resolves or the future is dropped. If the lock cannot be
    /// acquired within the timeout the call fails without ever running `f`.
    pub async fn with_lock<F, Fut, T>(&self, f: F) -> Result<T, JeevesError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let guard = match tokio::time::timeout(self.acquire_timeout, self.inner.lock()).await {
            Ok(guard) => guard,
            Err(_) => {
                warn!(
                    timeout_ms = self.acquire_timeout.as_millis() as u64,
                    "agent lock acquisition timed out"
                );
                return Err(JeevesError::AgentBusy {
                    waited_ms: self.acquire_timeout.as_millis() as u64,
                });
            }
        };
        debug!("agent lock acquired");
        let result = f().await;
        drop(guard);
        Ok(result)
    }
}
