use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Health reporting settings.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct MonitorConfig {
    /// Whether the replicator periodically logs health reports.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Length, in seconds, of the window used for throughput and error rate.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    /// Pending backlog at which the health status turns to warning.
    #[serde(default = "default_backlog_warning_threshold")]
    pub backlog_warning_threshold: u64,
}

impl MonitorConfig {
    pub const DEFAULT_INTERVAL_SECS: u64 = 60;

    pub const DEFAULT_BACKLOG_WARNING_THRESHOLD: u64 = 1000;

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.interval_secs == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "monitor.interval_secs".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_secs: default_interval_secs(),
            backlog_warning_threshold: default_backlog_warning_threshold(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_interval_secs() -> u64 {
    MonitorConfig::DEFAULT_INTERVAL_SECS
}

fn default_backlog_warning_threshold() -> u64 {
    MonitorConfig::DEFAULT_BACKLOG_WARNING_THRESHOLD
}
