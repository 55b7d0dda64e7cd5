use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Settings of the per-table apply-lease.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct LeaseConfig {
    /// How long, in milliseconds, an acquired lease stays valid.
    ///
    /// Must comfortably exceed the time needed to apply and mark one batch, otherwise a slow
    /// replicator loses its lease and its status updates are rejected.
    #[serde(default = "default_lease_timeout_ms")]
    pub timeout_ms: u64,
}

impl LeaseConfig {
    pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.timeout_ms == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "lease.timeout_ms".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_lease_timeout_ms(),
        }
    }
}

fn default_lease_timeout_ms() -> u64 {
    LeaseConfig::DEFAULT_TIMEOUT_MS
}
