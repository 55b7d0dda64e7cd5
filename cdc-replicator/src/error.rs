use std::backtrace::Backtrace;
use std::error::Error;
use std::fmt;

use cdc::error::CdcError;

/// Result type for replicator operations.
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// Backtrace captured when an infrastructure error variant is created.
pub struct CapturedBacktrace(Backtrace);

impl CapturedBacktrace {
    fn capture() -> Self {
        Self(Backtrace::capture())
    }
}

impl fmt::Debug for CapturedBacktrace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Error type for the replicator service.
///
/// Wraps [`CdcError`] for capture and replication errors and adds variants for the service's own
/// infrastructure.
#[derive(Debug)]
pub enum ReplicatorError {
    /// Capture, audit store or replication error.
    Cdc(CdcError),
    /// Configuration error.
    Config(Box<dyn Error + Send + Sync>, CapturedBacktrace),
    /// I/O error, including runtime and signal handler setup.
    Io(std::io::Error, CapturedBacktrace),
}

impl ReplicatorError {
    /// Returns a short category label for this error.
    pub fn category(&self) -> &'static str {
        match self {
            ReplicatorError::Cdc(_) => "replication error",
            ReplicatorError::Config(_, _) => "configuration error",
            ReplicatorError::Io(_, _) => "i/o error",
        }
    }

    pub fn backtrace(&self) -> Option<&Backtrace> {
        match self {
            ReplicatorError::Cdc(err) => err.backtrace(),
            ReplicatorError::Config(_, backtrace) => Some(&backtrace.0),
            ReplicatorError::Io(_, backtrace) => Some(&backtrace.0),
        }
    }

    pub fn config<E: Error + Send + Sync + 'static>(err: E) -> Self {
        ReplicatorError::Config(Box::new(err), CapturedBacktrace::capture())
    }

    /// Returns a report for terminal output, listing the chain of causes.
    pub fn render_report(&self) -> String {
        let mut out = String::new();
        out.push_str("replicator failed\n");
        out.push_str(&format!("category: {}\n", self.category()));
        out.push_str(&format!("error: {self}\n"));

        if let ReplicatorError::Cdc(err) = self
            && let Some(errors) = err.errors()
        {
            for (idx, err) in errors.iter().enumerate() {
                out.push_str(&format!("error {}: {}\n", idx + 1, err.summary()));
            }
        } else {
            let mut source = Error::source(self);
            let mut idx = 1usize;
            while let Some(err) = source {
                out.push_str(&format!("cause {idx}: {err}\n"));
                source = err.source();
                idx += 1;
            }
        }

        if should_render_backtrace()
            && let Some(backtrace) = self.backtrace()
        {
            out.push_str("backtrace:\n");
            out.push_str(&backtrace.to_string());
            if !out.ends_with('\n') {
                out.push('\n');
            }
        }

        out
    }
}

fn should_render_backtrace() -> bool {
    matches!(
        std::env::var("RUST_BACKTRACE").as_deref(),
        Ok("1") | Ok("full")
    )
}

impl fmt::Display for ReplicatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicatorError::Cdc(err) => write!(f, "{err}"),
            ReplicatorError::Config(source, _) => write!(f, "configuration error: {source}"),
            ReplicatorError::Io(source, _) => write!(f, "i/o error: {source}"),
        }
    }
}

impl Error for ReplicatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ReplicatorError::Cdc(err) => err.source(),
            ReplicatorError::Config(source, _) => Some(source.as_ref()),
            ReplicatorError::Io(source, _) => Some(source),
        }
    }
}

impl From<std::io::Error> for ReplicatorError {
    fn from(err: std::io::Error) -> Self {
        ReplicatorError::Io(err, CapturedBacktrace::capture())
    }
}

impl From<CdcError> for ReplicatorError {
    fn from(err: CdcError) -> Self {
        ReplicatorError::Cdc(err)
    }
}

#[cfg(test)]
mod tests {
    use cdc::error::ErrorKind;

    use super::*;

    #[test]
    fn report_lists_every_aggregated_error() {
        let errors = vec![
            CdcError::from((ErrorKind::SetupFailed, "Capture setup failed", "users")),
            CdcError::from((ErrorKind::SetupFailed, "Capture setup failed", "orders")),
        ];
        let report = ReplicatorError::from(CdcError::from(errors)).render_report();

        assert!(report.contains("category: replication error"));
        assert!(report.contains("error 1: [SetupFailed] Capture setup failed: users"));
        assert!(report.contains("error 2: [SetupFailed] Capture setup failed: orders"));
    }

    #[test]
    fn config_errors_report_their_cause() {
        let err = ReplicatorError::config(std::io::Error::other("missing base.yaml"));

        assert_eq!(err.category(), "configuration error");
        assert!(err.to_string().contains("missing base.yaml"));
    }
}
