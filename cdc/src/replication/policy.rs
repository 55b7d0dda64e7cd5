use crate::error::{CdcError, ErrorKind};

/// Scope of a replication failure.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RetryDirective {
    /// The whole batch is aborted without touching any record status, and the table is retried
    /// after a backoff.
    Systemic,
    /// Only the record being applied is blamed: its attempt count grows until it is dead-lettered.
    Record,
}

/// Policy describing how a [`CdcError`] raised while replicating a batch is handled.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ErrorHandlingPolicy {
    retry_directive: RetryDirective,
    solution: Option<&'static str>,
}

impl ErrorHandlingPolicy {
    const fn new(retry_directive: RetryDirective, solution: Option<&'static str>) -> Self {
        Self {
            retry_directive,
            solution,
        }
    }

    pub fn retry_directive(&self) -> RetryDirective {
        self.retry_directive
    }

    /// Returns an optional operator-facing solution message.
    pub fn solution(&self) -> Option<&'static str> {
        self.solution
    }
}

/// Builds an [`ErrorHandlingPolicy`] from a [`CdcError`].
pub fn build_error_handling_policy(error: &CdcError) -> ErrorHandlingPolicy {
    match error.kind() {
        // Failures of the infrastructure rather than of a record. Keep this list narrow: a
        // systemic error never advances a record towards the dead letter status.
        ErrorKind::TargetConnectionFailed
        | ErrorKind::AuditStoreConnectionFailed
        | ErrorKind::AuditStoreQueryFailed
        | ErrorKind::LeaseLost => ErrorHandlingPolicy::new(RetryDirective::Systemic, None),

        ErrorKind::ApplyFailed => ErrorHandlingPolicy::new(
            RetryDirective::Record,
            Some("Check that the target table exists and accepts the captured row."),
        ),
        ErrorKind::InvalidData
        | ErrorKind::SerializationError
        | ErrorKind::DeserializationError => ErrorHandlingPolicy::new(
            RetryDirective::Record,
            Some("Inspect the change record, fix the data and requeue it if it was dead-lettered."),
        ),

        #[cfg(feature = "failpoints")]
        ErrorKind::WithSystemicFailure => ErrorHandlingPolicy::new(
            RetryDirective::Systemic,
            Some("Will automatically retry after the backoff delay."),
        ),
        #[cfg(feature = "failpoints")]
        ErrorKind::WithRecordFailure => ErrorHandlingPolicy::new(
            RetryDirective::Record,
            Some("The record will be retried until it is dead-lettered."),
        ),

        // Unknown target errors are blamed on the record so that a poison record cannot stall its
        // table forever.
        _ => ErrorHandlingPolicy::new(
            RetryDirective::Record,
            Some(
                "There is no single prescribed solution for this error. Inspect the record's last error and requeue it once the cause is fixed.",
            ),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(kind: ErrorKind) -> CdcError {
        CdcError::from((kind, "test error"))
    }

    #[test]
    fn classifies_target_connection_failure_as_systemic() {
        let policy = build_error_handling_policy(&err(ErrorKind::TargetConnectionFailed));
        assert_eq!(policy.retry_directive(), RetryDirective::Systemic);
        assert_eq!(policy.solution(), None);
    }

    #[test]
    fn classifies_apply_failure_as_record_level() {
        let policy = build_error_handling_policy(&err(ErrorKind::ApplyFailed));
        assert_eq!(policy.retry_directive(), RetryDirective::Record);
        assert!(policy.solution().is_some());
    }

    #[test]
    fn classifies_unknown_kind_as_record_level() {
        let policy = build_error_handling_policy(&err(ErrorKind::Unknown));
        assert_eq!(policy.retry_directive(), RetryDirective::Record);
        assert!(policy.solution().is_some());
    }
}
