//! Serving process restarts.
//!
//! The serving process keeps the model artifact in memory, so moving the
//! alias only takes effect after a restart. A successful restart is followed
//! by a stabilization delay before anything touches shared storage.

use std::sync::Arc;
use std::time::Duration;

use modelwatch_reconcile::CyclePhase;
use tracing::{debug, error, info};

use crate::exec::{CommandExecutor, CommandOutcome, CommandSpec};

/// Result of a restart attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartOutcome {
    /// The restart command succeeded and the stabilization delay elapsed.
    Restarted(CommandOutcome),

    /// No serving process is configured.
    Skipped,

    /// The restart command failed. Nothing should advance.
    Failed(CommandOutcome),
}

impl RestartOutcome {
    /// Returns true if the loop may advance its state.
    pub fn allows_advance(&self) -> bool {
        !matches!(self, RestartOutcome::Failed(_))
    }
}

/// Drives restarts of the serving process.
pub struct RestartCoordinator {
    executor: Arc<dyn CommandExecutor>,
    stabilization_delay: Duration,
}

impl RestartCoordinator {
    pub fn new(executor: Arc<dyn CommandExecutor>, stabilization_delay: Duration) -> Self {
        Self {
            executor,
            stabilization_delay,
        }
    }

    /// Command used to restart `container`.
    pub fn restart_command(container: &str) -> CommandSpec {
        CommandSpec::new(["docker", "restart", container])
    }

    /// Restart the serving process named by `process_id`.
    ///
    /// `None` means no serving process is configured and the restart is
    /// skipped.
    pub async fn restart_serving_process(&self, process_id: Option<&str>) -> RestartOutcome {
        let Some(container) = process_id else {
            info!("No serving process configured, skipping restart");
            return RestartOutcome::Skipped;
        };

        info!(container, "Restarting serving process");
        let outcome = self.executor.run(&Self::restart_command(container)).await;
        let elapsed_ms = outcome.elapsed.as_millis() as u64;

        if !outcome.succeeded() {
            error!(
                container,
                elapsed_ms,
                exit_code = ?outcome.exit_code(),
                status = %outcome.status,
                stderr = %outcome.failure_detail(),
                "Restart failed"
            );
            return RestartOutcome::Failed(outcome);
        }

        info!(
            container,
            elapsed_ms,
            stabilization_secs = self.stabilization_delay.as_secs_f64(),
            "Restart succeeded, waiting for the serving process to stabilize"
        );
        debug!(phase = %CyclePhase::Stabilizing, "Entering phase");
        tokio::time::sleep(self.stabilization_delay).await;

        RestartOutcome::Restarted(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockExecutor;

    #[tokio::test]
    async fn test_restart_success() {
        let executor = Arc::new(MockExecutor::new());
        let coordinator = RestartCoordinator::new(executor.clone(), Duration::ZERO);

        let outcome = coordinator.restart_serving_process(Some("api_mlops_test")).await;
        assert!(matches!(outcome, RestartOutcome::Restarted(_)));
        assert!(outcome.allows_advance());

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].argv, vec!["docker", "restart", "api_mlops_test"]);
    }

    #[tokio::test]
    async fn test_restart_failure_returns_immediately() {
        let executor = Arc::new(MockExecutor::scripted([CommandOutcome::exited(
            1,
            "Error: No such container: api_mlops_test",
        )]));
        // A long delay would hang the test if the failure path slept.
        let coordinator = RestartCoordinator::new(executor, Duration::from_secs(3600));

        let outcome = coordinator.restart_serving_process(Some("api_mlops_test")).await;
        match &outcome {
            RestartOutcome::Failed(o) => assert_eq!(o.exit_code(), Some(1)),
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(!outcome.allows_advance());
    }

    #[tokio::test]
    async fn test_restart_skipped_without_process() {
        let executor = Arc::new(MockExecutor::new());
        let coordinator = RestartCoordinator::new(executor.clone(), Duration::ZERO);

        let outcome = coordinator.restart_serving_process(None).await;
        assert_eq!(outcome, RestartOutcome::Skipped);
        assert!(outcome.allows_advance());
        assert!(executor.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_waits_for_stabilization() {
        let executor = Arc::new(MockExecutor::new());
        let delay = Duration::from_secs(5);
        let coordinator = RestartCoordinator::new(executor, delay);

        let started = tokio::time::Instant::now();
        let outcome = coordinator.restart_serving_process(Some("api_mlops_test")).await;

        assert!(matches!(outcome, RestartOutcome::Restarted(_)));
        assert!(started.elapsed() >= delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_skips_stabilization() {
        let executor = Arc::new(MockExecutor::scripted([CommandOutcome::exited(1, "")]));
        let coordinator = RestartCoordinator::new(executor, Duration::from_secs(5));

        let started = tokio::time::Instant::now();
        let outcome = coordinator.restart_serving_process(Some("api_mlops_test")).await;

        assert!(!outcome.allows_advance());
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
