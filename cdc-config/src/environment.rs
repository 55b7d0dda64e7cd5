use std::fmt;
use std::io;
use std::str::FromStr;

/// Variable selecting which `configuration/{environment}` file overlays `base`.
pub const ENVIRONMENT_VAR: &str = "APP_ENVIRONMENT";

/// Deployment environment of the replicator, naming the configuration overlay to load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    /// Local runs against SQLite files. Used when [`ENVIRONMENT_VAR`] is unset.
    #[default]
    Dev,
    Prod,
}

impl Environment {
    const ALL: [Environment; 2] = [Environment::Dev, Environment::Prod];

    /// Reads [`ENVIRONMENT_VAR`], falling back to [`Environment::Dev`] when it is not set.
    pub fn load() -> Result<Environment, io::Error> {
        match std::env::var(ENVIRONMENT_VAR) {
            Ok(name) => name.parse(),
            Err(_) => Ok(Environment::default()),
        }
    }

    /// Stem of the overlay configuration file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Prod => "prod",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = io::Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let name = name.trim();

        Environment::ALL
            .into_iter()
            .find(|environment| environment.as_str().eq_ignore_ascii_case(name))
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("unknown environment `{name}`, expected `dev` or `prod`"),
                )
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_names_ignoring_case_and_whitespace() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert_eq!(" dev ".parse::<Environment>().unwrap(), Environment::Dev);
    }

    #[test]
    fn rejects_unknown_environments() {
        let err = "staging".parse::<Environment>().unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
        assert!(err.to_string().contains("staging"));
    }
}
