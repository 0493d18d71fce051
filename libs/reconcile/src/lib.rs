//! Reconciliation primitives for the model alias watcher.
//!
//! This library holds the pure half of the watcher: everything that can be
//! decided without touching the registry or spawning a process. Key concepts:
//!
//! - **Observed state**: the version the registry currently binds to the alias.
//! - **Known state**: the last version the serving process was restarted onto.
//! - **Drift**: observed differs from known; resolved by a restart followed
//!   by a cleanup pass over orphaned versions.
//!
//! # Invariants
//!
//! - [`ReconciliationState`] only advances after a restart succeeded or was
//!   explicitly skipped.
//! - An unknown observation (`None`) is never drift.
//! - Decisions are deterministic given the same inputs.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Opaque registry version token.
///
/// Versions are only compared for equality here; ordering is the registry's
/// concern.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(String);

impl VersionId {
    /// Wrap a registry version token.
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }

    /// Get the version string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for VersionId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for VersionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A registry version record as seen by the watcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelVersion {
    /// Version token.
    pub version: VersionId,

    /// Run that produced the version, if the registry still links one.
    pub run_id: Option<String>,

    /// Aliases currently pointing at this version (possibly empty).
    pub aliases: Vec<String>,
}

impl ModelVersion {
    /// Returns true if no alias references this version.
    pub fn is_orphan(&self) -> bool {
        self.aliases.is_empty()
    }
}

/// State carried by the loop from one cycle to the next.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationState {
    /// Version the serving process was last restarted onto.
    pub last_known_version: Option<VersionId>,
}

impl ReconciliationState {
    /// Create the initial state from the startup poll.
    pub fn new(last_known_version: Option<VersionId>) -> Self {
        Self { last_known_version }
    }

    /// Return the state advanced to `version`.
    ///
    /// Callers must only do this once the restart onto `version` succeeded
    /// or was skipped.
    pub fn advanced_to(self, version: VersionId) -> Self {
        Self {
            last_known_version: Some(version),
        }
    }
}

/// Returns true iff `current` is known and differs from `last`.
pub fn has_changed(last: Option<&VersionId>, current: Option<&VersionId>) -> bool {
    match current {
        Some(current) => last != Some(current),
        None => false,
    }
}

/// What a cycle has to do after polling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleDecision {
    /// The alias is unbound or the registry could not be read.
    Unknown,

    /// The alias still points at the known version.
    Unchanged(VersionId),

    /// The alias moved; the serving process must be restarted.
    Restart {
        previous: Option<VersionId>,
        current: VersionId,
    },
}

/// Decide the actions for one cycle given the carried state and a poll.
pub fn plan_cycle(state: &ReconciliationState, polled: Option<VersionId>) -> CycleDecision {
    let last = state.last_known_version.as_ref();
    match polled {
        None => CycleDecision::Unknown,
        Some(current) if has_changed(last, Some(&current)) => CycleDecision::Restart {
            previous: state.last_known_version.clone(),
            current,
        },
        Some(current) => CycleDecision::Unchanged(current),
    }
}

/// Phases a cycle moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CyclePhase {
    Polling,
    IdleWait,
    Restarting,
    Stabilizing,
    Cleaning,
    CollectingGarbage,
    ErrorBackoff,
}

impl CyclePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CyclePhase::Polling => "polling",
            CyclePhase::IdleWait => "idle_wait",
            CyclePhase::Restarting => "restarting",
            CyclePhase::Stabilizing => "stabilizing",
            CyclePhase::Cleaning => "cleaning",
            CyclePhase::CollectingGarbage => "collecting_garbage",
            CyclePhase::ErrorBackoff => "error_backoff",
        }
    }
}

impl fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a cleanup candidate was left in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The authoritative record shows an alias.
    Aliased,

    /// The version no longer exists.
    Missing,

    /// The version is the one the alias was just moved to.
    Promoted,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::Aliased => "aliased",
            SkipReason::Missing => "missing",
            SkipReason::Promoted => "promoted",
        }
    }
}

/// Result of processing one cleanup candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    /// Run (if any) and version record were deleted.
    Deleted,

    /// The candidate was left untouched.
    Skipped(SkipReason),

    /// A delete call failed; the message is the registry error.
    Failed(String),
}

impl DeletionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeletionOutcome::Deleted => "deleted",
            DeletionOutcome::Skipped(_) => "skipped",
            DeletionOutcome::Failed(_) => "failed",
        }
    }
}

/// Tally of one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    pub deleted: Vec<VersionId>,
    pub skipped: Vec<VersionId>,
    pub failed: Vec<VersionId>,
}

impl CleanupSummary {
    /// Record the outcome for a candidate.
    pub fn record(&mut self, version: VersionId, outcome: &DeletionOutcome) {
        match outcome {
            DeletionOutcome::Deleted => self.deleted.push(version),
            DeletionOutcome::Skipped(_) => self.skipped.push(version),
            DeletionOutcome::Failed(_) => self.failed.push(version),
        }
    }

    /// Number of versions actually removed from the registry.
    pub fn deleted_count(&self) -> usize {
        self.deleted.len()
    }

    /// Returns true if garbage collection has something to reclaim.
    pub fn needs_gc(&self) -> bool {
        self.deleted_count() > 0
    }
}

/// Default poll interval while nothing changes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// Default wait after a cycle fails unexpectedly.
pub const DEFAULT_ERROR_BACKOFF: Duration = Duration::from_secs(10);

/// Default wait after a successful restart before cleanup starts.
pub const DEFAULT_STABILIZATION_DELAY: Duration = Duration::from_secs(5);

/// Default pause between registry deletions.
pub const DEFAULT_DELETION_PACING: Duration = Duration::from_secs(1);

/// Default bound on a garbage collection command.
pub const DEFAULT_GC_TIMEOUT: Duration = Duration::from_secs(300);
