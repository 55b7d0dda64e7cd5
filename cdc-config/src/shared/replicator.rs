use std::collections::HashSet;

use serde::Deserialize;

use crate::Config;
use crate::shared::{MonitorConfig, ReplicationConfig, StoreConfig, TableConfig, ValidationError};

/// Complete configuration of the replicator service.
///
/// Does not implement [`serde::Serialize`] so that connection secrets are never written out by
/// accident.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicatorConfig {
    /// Database whose tables are captured. Also hosts the audit store.
    pub source: StoreConfig,
    /// Store the captured changes are replicated into.
    pub target: StoreConfig,
    /// Tables to capture and replicate.
    pub tables: Vec<TableConfig>,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
}

impl ReplicatorConfig {
    /// Validates the complete replicator configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if matches!(self.source, StoreConfig::Memory) {
            return Err(ValidationError::UnsupportedMemorySource);
        }

        if self.tables.is_empty() {
            return Err(ValidationError::NoTablesConfigured);
        }

        let mut seen = HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !seen.insert(table.source.as_str()) {
                return Err(ValidationError::DuplicateSourceTable(table.source.clone()));
            }
        }

        self.replication.validate()?;
        self.monitor.validate()?;

        Ok(())
    }
}

impl Config for ReplicatorConfig {
    const LIST_PARSE_KEYS: &'static [&'static str] = &[];
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::SqliteConnectionConfig;

    fn table(source: &str) -> TableConfig {
        TableConfig {
            source: source.to_string(),
            target: None,
            columns: vec![],
        }
    }

    fn config(tables: Vec<TableConfig>) -> ReplicatorConfig {
        ReplicatorConfig {
            source: StoreConfig::Sqlite(SqliteConnectionConfig::new("source.db")),
            target: StoreConfig::Memory,
            tables,
            replication: ReplicationConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }

    #[test]
    fn defaults_are_valid() {
        assert_eq!(config(vec![table("users")]).validate(), Ok(()));
    }

    #[test]
    fn rejects_duplicate_source_tables() {
        assert_eq!(
            config(vec![table("users"), table("users")]).validate(),
            Err(ValidationError::DuplicateSourceTable("users".to_string()))
        );
    }

    #[test]
    fn rejects_memory_source() {
        let mut config = config(vec![table("users")]);
        config.source = StoreConfig::Memory;

        assert_eq!(config.validate(), Err(ValidationError::UnsupportedMemorySource));
    }

    #[test]
    fn target_defaults_to_source_name() {
        let mut users = table("users");
        assert_eq!(users.target_table(), "users");

        users.target = Some("users_replica".to_string());
        assert_eq!(users.target_table(), "users_replica");
    }

    #[test]
    fn replication_defaults_match_documented_values() {
        let replication = ReplicationConfig::default();

        assert_eq!(replication.batch.max_size, 100);
        assert_eq!(replication.poll_interval_ms, 5_000);
        assert_eq!(replication.retry.max_attempts, 3);
        assert_eq!(replication.lease.timeout_ms, 30_000);
    }
}
