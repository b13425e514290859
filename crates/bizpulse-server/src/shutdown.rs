//! Relay shutdown: one root token, one child per connection.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// How long `bizpulse serve` waits for the listener after ctrl-c.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// How the listener task ended during a drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    Stopped,
    /// Still running at the deadline. The task is detached, not aborted.
    TimedOut,
}

/// Cancelling the root closes every socket; cancelling a child closes one.
#[derive(Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel, then wait up to `deadline` for the `listen` task to return.
    pub async fn drain_listener(
        &self,
        listener: JoinHandle<()>,
        deadline: Duration,
    ) -> DrainOutcome {
        self.shutdown();
        match tokio::time::timeout(deadline, listener).await {
            Ok(Ok(())) => {
                debug!("relay listener stopped");
                DrainOutcome::Stopped
            }
            Ok(Err(e)) => {
                warn!(error = %e, "relay listener task ended abnormally");
                DrainOutcome::Stopped
            }
            Err(_) => {
                warn!(
                    deadline_ms = u64::try_from(deadline.as_millis()).unwrap_or(u64::MAX),
                    "relay listener still running at drain deadline"
                );
                DrainOutcome::TimedOut
            }
        }
    }
}
