//! Replay engine configuration.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for the replay engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Per-submission timeout (ms). A timed out submission counts as a
    /// transient failure. `None` leaves failure signaling to the transport.
    pub submit_timeout_ms: Option<u64>,
    /// Submissions allowed per entry. A transient failure on the last one
    /// fails the entry. `None` retries on every pass.
    pub max_transient_attempts: Option<u32>,
    /// Record identity field.
    pub id_field: String,
    /// Record version field, taken from the server on merged resubmission.
    pub version_field: String,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            submit_timeout_ms: None,
            max_transient_attempts: None,
            id_field: "id".to_string(),
            version_field: "version".to_string(),
        }
    }
}

impl ReplayConfig {
    /// Returns the submission timeout, if any.
    pub fn submit_timeout(&self) -> Option<Duration> {
        self.submit_timeout_ms.map(Duration::from_millis)
    }

    pub(crate) fn validate(&self) -> SyncResult<()> {
        if self.id_field.trim().is_empty() {
            return Err(SyncError::Config("id_field must not be empty".into()));
        }
        if self.version_field.trim().is_empty() {
            return Err(SyncError::Config("version_field must not be empty".into()));
        }
        if self.id_field == self.version_field {
            return Err(SyncError::Config(
                "id_field and version_field must differ".into(),
            ));
        }
        if self.submit_timeout_ms == Some(0) {
            return Err(SyncError::Config("submit_timeout_ms must be positive".into()));
        }
        if self.max_transient_attempts == Some(0) {
            return Err(SyncError::Config(
                "max_transient_attempts must be positive".into(),
            ));
        }
        Ok(())
    }
}
