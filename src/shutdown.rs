use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Graceful shutdown coordinator for long-running relay commands.
///
/// Background loops receive child tokens; a ctrl-c or an explicit
/// [`trigger`](Self::trigger) cancels all of them at once.
#[derive(Debug, Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token for one background task.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel everything on ctrl-c.
    pub fn install_signal_handlers(&self) {
        let token = self.token.clone();
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    match result {
                        Ok(()) => info!("Received interrupt, shutting down gracefully"),
                        Err(e) => warn!(error = %e, "Failed to listen for interrupt"),
                    }
                    token.cancel();
                }
                _ = token.cancelled() => {}
            }
        });
    }

    /// Resolves once shutdown has been requested.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Cancel all tasks and wait up to `grace` for `drain` to finish.
    pub async fn shutdown_with<F>(&self, grace: Duration, drain: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        self.trigger();
        timeout(grace, drain)
            .await
            .map_err(|_| anyhow::anyhow!("Timeout after {:?} waiting for background tasks to stop", grace))?;
        info!("Graceful shutdown completed successfully");
        Ok(())
    }
}
