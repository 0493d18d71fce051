//! Orphaned version cleanup.
//!
//! After the serving process moved to a new version, versions no alias
//! points at are deleted from the registry so the garbage collector can
//! reclaim their artifacts. The pipeline:
//! 1. Proposes candidates from the (possibly cached) version listing
//! 2. Re-reads each candidate's authoritative record right before deleting
//! 3. Deletes the run, then the version record
//!
//! Candidates are processed one at a time with a pacing delay between
//! registry writes; a failure on one candidate never stops the others.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use modelwatch_reconcile::{CleanupSummary, DeletionOutcome, SkipReason, VersionId};
use tracing::{debug, info, warn};

use crate::error::RegistryResult;
use crate::registry::ModelRegistry;

/// Deletes versions that no alias references.
pub struct CleanupPipeline {
    registry: Arc<dyn ModelRegistry>,
    model: String,
    pacing: Duration,
}

impl CleanupPipeline {
    pub fn new(registry: Arc<dyn ModelRegistry>, model: &str, pacing: Duration) -> Self {
        Self {
            registry,
            model: model.to_string(),
            pacing,
        }
    }

    /// Versions whose listed alias set is empty.
    ///
    /// The listing may be stale; candidates are only proposals.
    pub async fn find_candidates(&self) -> RegistryResult<BTreeSet<VersionId>> {
        let versions = self.registry.list_versions(&self.model).await?;
        let total = versions.len();

        let candidates: BTreeSet<VersionId> = versions
            .into_iter()
            .filter(|v| v.is_orphan())
            .map(|v| v.version)
            .collect();

        info!(
            model = %self.model,
            total,
            candidates = candidates.len(),
            "Scanned versions for orphans"
        );
        Ok(candidates)
    }

    /// Delete `version` if its authoritative record still has no alias.
    pub async fn delete_if_orphan(&self, version: &VersionId) -> DeletionOutcome {
        let record = match self.registry.get_version(&self.model, version).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                info!(version = %version, decision = "skip", reason = SkipReason::Missing.as_str(), "Version already gone");
                return DeletionOutcome::Skipped(SkipReason::Missing);
            }
            Err(e) => {
                warn!(version = %version, decision = "fail", error = %e, "Could not verify candidate");
                return DeletionOutcome::Failed(e.to_string());
            }
        };

        if !record.is_orphan() {
            info!(
                version = %version,
                aliases = ?record.aliases,
                decision = "skip",
                reason = SkipReason::Aliased.as_str(),
                "Candidate regained an alias, keeping it"
            );
            return DeletionOutcome::Skipped(SkipReason::Aliased);
        }

        debug!(version = %version, run_id = ?record.run_id, decision = "verify", "Candidate verified as orphan");

        // The registry will not reclaim storage for a version whose run is
        // still live, so the run goes first and a failure stops here.
        if let Some(run_id) = record.run_id.as_deref() {
            if let Err(e) = self.registry.delete_run(run_id).await {
                warn!(
                    version = %version,
                    run_id,
                    decision = "fail",
                    error = %e,
                    "Failed to delete run, leaving version in place"
                );
                return DeletionOutcome::Failed(e.to_string());
            }
            debug!(version = %version, run_id, "Deleted run");
            tokio::time::sleep(self.pacing).await;
        }

        match self.registry.delete_version(&self.model, version).await {
            Ok(()) => {
                info!(version = %version, run_id = ?record.run_id, decision = "delete", "Deleted orphaned version");
                DeletionOutcome::Deleted
            }
            Err(e) => {
                warn!(version = %version, decision = "fail", error = %e, "Failed to delete version");
                DeletionOutcome::Failed(e.to_string())
            }
        }
    }

    /// Run a full pass. `promoted` is never deleted, whatever the listing says.
    pub async fn run(&self, promoted: Option<&VersionId>) -> RegistryResult<CleanupSummary> {
        let candidates = self.find_candidates().await?;
        let mut summary = CleanupSummary::default();

        for (index, version) in candidates.into_iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(self.pacing).await;
            }

            let outcome = if Some(&version) == promoted {
                info!(
                    version = %version,
                    decision = "skip",
                    reason = SkipReason::Promoted.as_str(),
                    "Listing shows the promoted version without alias, keeping it"
                );
                DeletionOutcome::Skipped(SkipReason::Promoted)
            } else {
                self.delete_if_orphan(&version).await
            };

            debug!(version = %version, outcome = outcome.as_str(), "Candidate processed");
            summary.record(version, &outcome);
        }

        info!(
            model = %self.model,
            deleted = summary.deleted.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "Cleanup pass complete"
        );
        Ok(summary)
    }
}
