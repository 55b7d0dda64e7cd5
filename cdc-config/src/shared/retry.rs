use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Retry and backoff settings for failed replication passes and records.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct RetryConfig {
    /// Number of failed attempts a change record may accumulate before it is dead-lettered.
    ///
    /// A record is moved to the dead letter state once its attempt count exceeds this value.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay, in milliseconds, before the first retry.
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Upper bound, in milliseconds, for the exponential backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Multiplier applied to the delay after every consecutive failure.
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
}

impl RetryConfig {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    pub const DEFAULT_INITIAL_DELAY_MS: u64 = 10_000;

    pub const DEFAULT_MAX_DELAY_MS: u64 = 300_000;

    pub const DEFAULT_BACKOFF_FACTOR: f64 = 2.0;

    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Validates retry settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "retry.max_attempts".to_string(),
                constraint: "must be greater than 0".to_string(),
            });
        }

        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return Err(ValidationError::InvalidFieldValue {
                field: "retry.backoff_factor".to_string(),
                constraint: "must be a finite number greater than or equal to 1".to_string(),
            });
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ValidationError::InvalidFieldValue {
                field: "retry.max_delay_ms".to_string(),
                constraint: "must be greater than or equal to `retry.initial_delay_ms`".to_string(),
            });
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
        }
    }
}

fn default_max_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_initial_delay_ms() -> u64 {
    RetryConfig::DEFAULT_INITIAL_DELAY_MS
}

fn default_max_delay_ms() -> u64 {
    RetryConfig::DEFAULT_MAX_DELAY_MS
}

fn default_backoff_factor() -> f64 {
    RetryConfig::DEFAULT_BACKOFF_FACTOR
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_shrinking_backoff_factor() {
        let config = RetryConfig {
            backoff_factor: 0.5,
            ..RetryConfig::default()
        };

        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue { field, .. }) if field == "retry.backoff_factor"
        ));
    }

    #[test]
    fn rejects_max_delay_below_initial_delay() {
        let config = RetryConfig {
            initial_delay_ms: 1_000,
            max_delay_ms: 10,
            ..RetryConfig::default()
        };

        assert!(config.validate().is_err());
    }
}
