use anyhow::Result;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipeline::Orchestrator;

/// Graceful shutdown coordinator for Reelflow
///
/// Owns the process-wide shutdown token. Runs see it at their next stage
/// boundary and stop without touching task status, so tasks resume on restart.
#[derive(Debug, Clone, Default)]
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

    pub fn trigger(&self) {
        if !self.token.is_cancelled() {
            info!("Shutdown requested");
        }
        self.token.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancel the token when SIGINT or SIGTERM arrives.
    pub fn install_signal_handlers(&self) -> Result<()> {
        info!("Installing signal handlers for graceful shutdown");
        let coordinator = self.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;
            tokio::spawn(async move {
                tokio::select! {
                    _ = sigint.recv() => info!(signal = "SIGINT", "Signal received"),
                    _ = sigterm.recv() => info!(signal = "SIGTERM", "Signal received"),
                    _ = coordinator.token.cancelled() => return,
                }
                coordinator.trigger();
            });
        }

        #[cfg(not(unix))]
        tokio::spawn(async move {
            tokio::select! {
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Failed to listen for ctrl-c");
                        return;
                    }
                    info!(signal = "ctrl-c", "Signal received");
                }
                _ = coordinator.token.cancelled() => return,
            }
            coordinator.trigger();
        });

        Ok(())
    }

    /// Wait until shutdown is triggered.
    pub async fn wait_for_shutdown(&self) {
        self.token.cancelled().await;
    }

    /// Wait for in-process runs to reach a boundary, then log final counters.
    pub async fn shutdown_all_services(&self, orchestrator: &Orchestrator, grace: Duration) {
        self.trigger();
        info!("Initiating graceful shutdown...");

        let drained = timeout(grace, async {
            while orchestrator.active_runs() > 0 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                active_runs = orchestrator.active_runs(),
                "Runs still active after grace period"
            );
        }

        crate::observability::pipeline_metrics().log_stats();
        info!("Graceful shutdown completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_shared_token() {
        let coordinator = ShutdownCoordinator::new();
        let token = coordinator.token();
        assert!(!token.is_cancelled());

        coordinator.trigger();
        assert!(token.is_cancelled());
        assert!(coordinator.is_shutting_down());
        coordinator.wait_for_shutdown().await;
    }
}
