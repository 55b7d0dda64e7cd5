use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::{BatchConfig, LeaseConfig, RetryConfig, ValidationError};

/// Settings consumed by the replication engine.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ReplicationConfig {
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    /// Idle wait, in milliseconds, between two replication passes that found nothing to do.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl ReplicationConfig {
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 5_000;

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        self.batch.validate()?;
        self.retry.validate()?;
        self.lease.validate()?;

        Ok(())
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            lease: LeaseConfig::default(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_poll_interval_ms() -> u64 {
    ReplicationConfig::DEFAULT_POLL_INTERVAL_MS
}
