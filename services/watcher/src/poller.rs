//! Alias polling.

use std::sync::Arc;

use modelwatch_reconcile::VersionId;
use tracing::{debug, warn};

use crate::registry::ModelRegistry;

/// Answers "which version holds the alias right now?".
pub struct VersionPoller {
    registry: Arc<dyn ModelRegistry>,
    model: String,
    alias: String,
}

impl VersionPoller {
    pub fn new(registry: Arc<dyn ModelRegistry>, model: &str, alias: &str) -> Self {
        Self {
            registry,
            model: model.to_string(),
            alias: alias.to_string(),
        }
    }

    /// Current alias target, or `None` if it is unbound or the registry
    /// could not be reached. Never fails: an unknown state is a normal
    /// operating condition.
    pub async fn get_current_version(&self) -> Option<VersionId> {
        match self
            .registry
            .get_version_by_alias(&self.model, &self.alias)
            .await
        {
            Ok(Some(version)) => Some(version.version),
            Ok(None) => {
                debug!(model = %self.model, alias = %self.alias, "Alias is not bound");
                None
            }
            Err(e) => {
                warn!(
                    model = %self.model,
                    alias = %self.alias,
                    error = %e,
                    "Alias lookup failed, treating as unknown"
                );
                None
            }
        }
    }
}
