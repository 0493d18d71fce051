//! Reconciliation loop for the production alias.
//!
//! The reconciler:
//! - Polls the registry for the version behind the alias
//! - Restarts the serving process when the alias moved
//! - Deletes orphaned versions and garbage collects their artifacts
//!
//! Each cycle is a step `reconcile(state) -> report` where the report
//! carries the state for the next cycle. The loop owns the timer and the
//! shutdown signal; the step never sleeps except for the restart
//! stabilization delay and deletion pacing.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use modelwatch_reconcile::{
    plan_cycle, CleanupSummary, CycleDecision, CyclePhase, ReconciliationState, VersionId,
    DEFAULT_ERROR_BACKOFF, DEFAULT_POLL_INTERVAL,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cleanup::CleanupPipeline;
use crate::config::Config;
use crate::exec::CommandExecutor;
use crate::gc::{GarbageCollector, GcOutcome};
use crate::poller::VersionPoller;
use crate::registry::ModelRegistry;
use crate::restart::{RestartCoordinator, RestartOutcome};

/// Consecutive failed cycles logged at `warn` before escalating to `error`.
const WARN_FAILURE_THRESHOLD: u32 = 3;

/// Reconciliation loop configuration.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Wait between cycles.
    pub poll_interval: Duration,

    /// Wait after a cycle died unexpectedly.
    pub error_backoff: Duration,

    /// Stop after the first cycle.
    pub once: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            error_backoff: DEFAULT_ERROR_BACKOFF,
            once: false,
        }
    }
}

impl From<&Config> for ReconcilerConfig {
    fn from(config: &Config) -> Self {
        Self {
            poll_interval: config.poll_interval,
            error_backoff: config.error_backoff,
            once: config.once,
        }
    }
}

/// What a cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// The alias is unbound or the registry was unreachable.
    Unknown,

    /// The alias still points at the known version.
    Unchanged(VersionId),

    /// The serving process now runs `current`.
    Converged {
        previous: Option<VersionId>,
        current: VersionId,
        restart: RestartOutcome,
        /// `Err` holds the listing error when no cleanup pass ran.
        cleanup: Result<CleanupSummary, String>,
        gc: GcOutcome,
    },

    /// The restart failed; the same drift is retried next cycle.
    RestartFailed {
        previous: Option<VersionId>,
        current: VersionId,
        restart: RestartOutcome,
    },
}

impl CycleOutcome {
    /// Returns true if the cycle left drift behind.
    pub fn is_failure(&self) -> bool {
        matches!(self, CycleOutcome::RestartFailed { .. })
    }
}

/// Report of one cycle.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// When the alias was polled.
    pub polled_at: DateTime<Utc>,

    /// State to carry into the next cycle.
    pub state: ReconciliationState,

    pub outcome: CycleOutcome,

    /// Phases visited, in order.
    pub phases: Vec<CyclePhase>,
}

/// Reconciler for the production alias.
pub struct Reconciler {
    poller: VersionPoller,
    restarter: RestartCoordinator,
    cleanup: CleanupPipeline,
    gc: GarbageCollector,

    /// Container restarted on drift. `None` skips restarts.
    serving_process: Option<String>,

    model: String,
    alias: String,
    config: ReconcilerConfig,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(
        config: &Config,
        registry: Arc<dyn ModelRegistry>,
        executor: Arc<dyn CommandExecutor>,
    ) -> Self {
        Self {
            poller: VersionPoller::new(Arc::clone(&registry), &config.model_name, &config.alias),
            restarter: RestartCoordinator::new(Arc::clone(&executor), config.stabilization_delay),
            cleanup: CleanupPipeline::new(registry, &config.model_name, config.deletion_pacing),
            gc: GarbageCollector::new(executor, config),
            serving_process: config.serving_container.clone(),
            model: config.model_name.clone(),
            alias: config.alias.clone(),
            config: ReconcilerConfig::from(config),
        }
    }

    /// Build the starting state from a first poll.
    pub async fn initial_state(&self) -> ReconciliationState {
        let current = self.poller.get_current_version().await;
        info!(
            model = %self.model,
            alias = %self.alias,
            current_version = ?current.as_ref().map(VersionId::as_str),
            "Current production version"
        );
        ReconciliationState::new(current)
    }

    /// Run one cycle from `state`.
    pub async fn reconcile(&self, state: ReconciliationState) -> CycleReport {
        let polled_at = Utc::now();
        let mut phases = Vec::new();
        enter(&mut phases, CyclePhase::Polling);

        let polled = self.poller.get_current_version().await;

        let (state, outcome) = match plan_cycle(&state, polled) {
            CycleDecision::Unknown => {
                warn!(
                    model = %self.model,
                    alias = %self.alias,
                    polled_at = %polled_at,
                    "No version found for alias"
                );
                (state, CycleOutcome::Unknown)
            }
            CycleDecision::Unchanged(current) => {
                info!(
                    polled_at = %polled_at,
                    current_version = %current,
                    "No changes"
                );
                (state, CycleOutcome::Unchanged(current))
            }
            CycleDecision::Restart { previous, current } => {
                info!(
                    polled_at = %polled_at,
                    previous_version = ?previous.as_ref().map(VersionId::as_str),
                    current_version = %current,
                    "Model change detected"
                );
                self.converge(state, previous, current, &mut phases).await
            }
        };

        enter(&mut phases, CyclePhase::IdleWait);
        CycleReport {
            polled_at,
            state,
            outcome,
            phases,
        }
    }

    /// Restart onto `current`, then clean up behind it.
    async fn converge(
        &self,
        state: ReconciliationState,
        previous: Option<VersionId>,
        current: VersionId,
        phases: &mut Vec<CyclePhase>,
    ) -> (ReconciliationState, CycleOutcome) {
        enter(phases, CyclePhase::Restarting);
        let restart = self
            .restarter
            .restart_serving_process(self.serving_process.as_deref())
            .await;

        if !restart.allows_advance() {
            warn!(
                current_version = %current,
                "Keeping previous version state, restart will be retried"
            );
            return (
                state,
                CycleOutcome::RestartFailed {
                    previous,
                    current,
                    restart,
                },
            );
        }
        if matches!(restart, RestartOutcome::Restarted(_)) {
            // The coordinator logs this phase when its delay starts.
            phases.push(CyclePhase::Stabilizing);
        }

        // The restart is what the serving layer cares about; cleanup and GC
        // failures below never roll this back.
        let state = state.advanced_to(current.clone());
        info!(current_version = %current, "Production version recorded");

        enter(phases, CyclePhase::Cleaning);
        let cleanup = match self.cleanup.run(Some(&current)).await {
            Ok(summary) => Ok(summary),
            Err(e) => {
                error!(error = %e, "Cleanup pass aborted, orphans will be retried on the next change");
                Err(e.to_string())
            }
        };

        let deleted = cleanup.as_ref().map(CleanupSummary::deleted_count).unwrap_or(0);
        if cleanup.as_ref().is_ok_and(CleanupSummary::needs_gc) {
            enter(phases, CyclePhase::CollectingGarbage);
        }
        let gc = self.gc.collect(deleted).await;

        (
            state,
            CycleOutcome::Converged {
                previous,
                current,
                restart,
                cleanup,
                gc,
            },
        )
    }

    /// Run the reconciliation loop until shutdown. Returns the final state.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> ReconciliationState {
        info!(
            model = %self.model,
            alias = %self.alias,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            error_backoff_secs = self.config.error_backoff.as_secs(),
            "Starting reconciliation loop"
        );

        let mut state = self.initial_state().await;
        let mut consecutive_failures = 0u32;

        loop {
            if *shutdown.borrow() {
                info!("Reconciler shutting down");
                break;
            }

            // Each cycle runs in its own task so a panic is contained and
            // the pre-cycle state survives it.
            let cycle = tokio::spawn({
                let reconciler = Arc::clone(&self);
                let state = state.clone();
                async move { reconciler.reconcile(state).await }
            });

            let wait = match cycle.await {
                Ok(report) => {
                    if report.outcome.is_failure() {
                        consecutive_failures += 1;
                        log_failure(consecutive_failures, "Cycle left drift unresolved");
                    } else {
                        consecutive_failures = 0;
                    }
                    state = report.state;
                    self.config.poll_interval
                }
                Err(e) => {
                    consecutive_failures += 1;
                    log_failure(consecutive_failures, &format!("Cycle crashed: {}", e));
                    debug!(phase = %CyclePhase::ErrorBackoff, "Backing off");
                    self.config.error_backoff
                }
            };

            if self.config.once {
                info!("Single cycle requested, exiting");
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("Reconciler shutting down");
                        break;
                    }
                }
            }
        }

        state
    }
}

fn enter(phases: &mut Vec<CyclePhase>, phase: CyclePhase) {
    debug!(phase = %phase, "Entering phase");
    phases.push(phase);
}

fn log_failure(consecutive_failures: u32, message: &str) {
    if consecutive_failures <= WARN_FAILURE_THRESHOLD {
        warn!(consecutive_failures, "{}", message);
    } else {
        error!(consecutive_failures, "{}", message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconciler_config_default() {
        let config = ReconcilerConfig::default();
        assert_eq!(config.poll_interval, Duration::from_secs(20));
        assert_eq!(config.error_backoff, Duration::from_secs(10));
        assert!(!config.once);
    }

    #[test]
    fn test_reconciler_config_from_config() {
        let config = Config {
            poll_interval: Duration::from_secs(2),
            once: true,
            ..Config::default()
        };
        let reconciler_config = ReconcilerConfig::from(&config);
        assert_eq!(reconciler_config.poll_interval, Duration::from_secs(2));
        assert_eq!(reconciler_config.error_backoff, Duration::from_secs(10));
        assert!(reconciler_config.once);
    }
}
