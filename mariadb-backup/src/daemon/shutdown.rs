//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A signal cancels the shared token. An in-flight backup stops before its
//! manifest is written, so the staging directory stays partial; a restore
//! stops before the next replay.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shutdown coordinator
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// Token handed to coordinators and orchestrators
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Cancel without a signal
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGTERM or SIGINT, then cancel the token
    pub async fn wait_for_signal(&self) -> std::io::Result<()> {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), cancelling current job...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, cancelling current job...");
            }
            _ = self.token.cancelled() => return Ok(()),
        }

        self.token.cancel();
        Ok(())
    }

    /// Listen for signals in the background
    pub fn spawn(self) -> CancellationToken {
        let token = self.token();
        tokio::spawn(async move {
            if let Err(e) = self.wait_for_signal().await {
                tracing::warn!("Failed to install signal handlers: {}", e);
            }
        });
        token
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
