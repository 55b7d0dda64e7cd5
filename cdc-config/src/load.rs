use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use thiserror::Error;

use crate::environment::Environment;

/// Directory holding configuration files, relative to the working directory.
const CONFIGURATION_DIR: &str = "configuration";

/// Extensions tried, in order, for every configuration file.
const CONFIG_FILE_EXTENSIONS: &[&str] = &["yaml", "yml", "json"];

/// Prefix of environment variables that override file values.
const ENV_PREFIX: &str = "APP";

/// Separator between the prefix and the first key segment.
const ENV_PREFIX_SEPARATOR: &str = "_";

/// Separator for nested keys, e.g. `APP_REPLICATION__BATCH__MAX_SIZE`.
const ENV_SEPARATOR: &str = "__";

/// Separator for list values in environment variables.
const LIST_SEPARATOR: &str = ",";

/// Implemented by top-level configuration structures.
pub trait Config {
    /// Keys whose environment variable values are parsed as comma-separated lists.
    const LIST_PARSE_KEYS: &'static [&'static str];
}

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum LoadConfigError {
    #[error("failed to determine the current directory: {0}")]
    CurrentDir(#[source] io::Error),

    #[error("configuration directory `{0}` does not exist")]
    MissingConfigurationDirectory(PathBuf),

    #[error("could not locate `{stem}` configuration in `{directory}`; attempted: {attempted}")]
    ConfigurationFileMissing {
        stem: String,
        directory: PathBuf,
        attempted: String,
    },

    #[error("failed to determine runtime environment: {0}")]
    Environment(#[source] io::Error),

    #[error("failed to build configuration: {0}")]
    Builder(#[source] rust_cli_config::ConfigError),

    #[error("failed to deserialize configuration: {0}")]
    Deserialization(#[source] rust_cli_config::ConfigError),
}

/// Loads configuration from `configuration/base.*`, `configuration/{environment}.*` and
/// `APP_`-prefixed environment variables, in increasing order of precedence.
pub fn load_config<T>() -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    let base_path = std::env::current_dir().map_err(LoadConfigError::CurrentDir)?;
    let environment = Environment::load().map_err(LoadConfigError::Environment)?;

    load_config_from(&base_path.join(CONFIGURATION_DIR), environment)
}

/// Loads configuration from an explicit directory and environment.
pub fn load_config_from<T>(directory: &Path, environment: Environment) -> Result<T, LoadConfigError>
where
    T: Config + DeserializeOwned,
{
    if !directory.is_dir() {
        return Err(LoadConfigError::MissingConfigurationDirectory(
            directory.to_path_buf(),
        ));
    }

    let base_file = find_configuration_file(directory, "base")?;
    let environment_file = find_configuration_file(directory, environment.as_str())?;

    let mut environment_source = rust_cli_config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator(ENV_PREFIX_SEPARATOR)
        .separator(ENV_SEPARATOR);

    if !T::LIST_PARSE_KEYS.is_empty() {
        environment_source = environment_source
            .try_parsing(true)
            .list_separator(LIST_SEPARATOR);

        for key in T::LIST_PARSE_KEYS {
            environment_source = environment_source.with_list_parse_key(key);
        }
    }

    let settings = rust_cli_config::Config::builder()
        .add_source(rust_cli_config::File::from(base_file))
        .add_source(rust_cli_config::File::from(environment_file))
        .add_source(environment_source)
        .build()
        .map_err(LoadConfigError::Builder)?;

    settings
        .try_deserialize::<T>()
        .map_err(LoadConfigError::Deserialization)
}

fn find_configuration_file(directory: &Path, stem: &str) -> Result<PathBuf, LoadConfigError> {
    let candidates: Vec<PathBuf> = CONFIG_FILE_EXTENSIONS
        .iter()
        .map(|extension| directory.join(format!("{stem}.{extension}")))
        .collect();

    if let Some(path) = candidates.iter().find(|path| path.is_file()) {
        return Ok(path.clone());
    }

    let attempted = candidates
        .iter()
        .map(|path| format!("`{}`", path.display()))
        .collect::<Vec<_>>()
        .join(", ");

    Err(LoadConfigError::ConfigurationFileMissing {
        stem: stem.to_string(),
        directory: directory.to_path_buf(),
        attempted,
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::shared::{ReplicatorConfig, StoreConfig};

    const BASE: &str = r#"
tables:
  - source: users
    target: users_replica
replication:
  batch:
    max_size: 50
"#;

    const PROD: &str = r#"
source:
  sqlite:
    path: /var/lib/cdc/source.db
target: memory
replication:
  poll_interval_ms: 250
"#;

    #[test]
    fn overlay_takes_precedence_over_base() {
        let directory = tempfile::tempdir().unwrap();
        fs::write(directory.path().join("base.yaml"), BASE).unwrap();
        fs::write(directory.path().join("prod.yml"), PROD).unwrap();

        let config: ReplicatorConfig =
            load_config_from(directory.path(), Environment::Prod).unwrap();

        assert_eq!(config.tables[0].target_table(), "users_replica");
        assert_eq!(config.replication.batch.max_size, 50);
        assert_eq!(config.replication.poll_interval_ms, 250);
        assert_eq!(config.replication.retry.max_attempts, 3);
        assert!(matches!(config.source, StoreConfig::Sqlite(_)));
        assert!(matches!(config.target, StoreConfig::Memory));
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn missing_overlay_lists_attempted_files() {
        let directory = tempfile::tempdir().unwrap();
        fs::write(directory.path().join("base.yaml"), BASE).unwrap();

        let err = load_config_from::<ReplicatorConfig>(directory.path(), Environment::Dev)
            .unwrap_err();

        let LoadConfigError::ConfigurationFileMissing { stem, attempted, .. } = err else {
            panic!("expected a missing file error, got {err}");
        };
        assert_eq!(stem, "dev");
        assert!(attempted.contains("dev.yaml") && attempted.contains("dev.json"));
    }

    #[test]
    fn missing_directory_is_reported() {
        let directory = tempfile::tempdir().unwrap();
        let missing = directory.path().join("configuration");

        let err = load_config_from::<ReplicatorConfig>(&missing, Environment::Dev).unwrap_err();

        assert!(matches!(err, LoadConfigError::MissingConfigurationDirectory(path) if path == missing));
    }
}
