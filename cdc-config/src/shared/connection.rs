use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode};

use crate::SerializableSecretString;

/// Converts a connection configuration into driver specific connect options.
pub trait IntoConnectOptions<Output> {
    /// Builds the connect options described by this configuration.
    fn connect_options(&self) -> Output;
}

/// Database engine backing either side of the replication.
///
/// On the source side the engine also hosts the audit store, since capture triggers must append
/// to it inside the mutating transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreConfig {
    /// In-process memory engine, usable only as a target by the replicator service.
    Memory,
    /// SQLite database file.
    Sqlite(SqliteConnectionConfig),
    /// Postgres database.
    Postgres(PgConnectionConfig),
}

/// Connection settings for a SQLite database file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SqliteConnectionConfig {
    /// Path of the database file.
    pub path: PathBuf,
    /// Whether the file is created when missing.
    #[serde(default = "default_create_if_missing")]
    pub create_if_missing: bool,
}

impl SqliteConnectionConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            create_if_missing: true,
        }
    }
}

impl IntoConnectOptions<SqliteConnectOptions> for SqliteConnectionConfig {
    fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(&self.path)
            .create_if_missing(self.create_if_missing)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
    }
}

fn default_create_if_missing() -> bool {
    true
}

/// Connection settings for a Postgres database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    /// Hostname or IP address of the server.
    pub host: String,
    /// Port the server listens on.
    pub port: u16,
    /// Name of the database.
    pub name: String,
    /// User to authenticate as.
    pub username: String,
    /// Password of the user, redacted in debug output.
    pub password: Option<SerializableSecretString>,
}

impl IntoConnectOptions<PgConnectOptions> for PgConnectionConfig {
    fn connect_options(&self) -> PgConnectOptions {
        let mut options = PgConnectOptions::new_without_pgpass()
            .host(&self.host)
            .port(self.port)
            .username(&self.username)
            .database(&self.name)
            .ssl_mode(PgSslMode::Prefer);

        if let Some(password) = &self.password {
            options = options.password(password.expose_secret());
        }

        options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_tagged_store_configs() {
        let sqlite: StoreConfig =
            serde_json::from_str(r#"{"sqlite": {"path": "source.db"}}"#).unwrap();
        assert!(matches!(
            sqlite,
            StoreConfig::Sqlite(SqliteConnectionConfig { create_if_missing: true, .. })
        ));

        let memory: StoreConfig = serde_json::from_str(r#""memory""#).unwrap();
        assert!(matches!(memory, StoreConfig::Memory));
    }

    #[test]
    fn password_is_redacted_in_debug_output() {
        let config = PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5432,
            name: "app".to_string(),
            username: "cdc".to_string(),
            password: Some("hunter2".to_string().into()),
        };

        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
