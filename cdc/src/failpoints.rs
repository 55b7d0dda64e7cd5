use fail::fail_point;

use crate::bail;
use crate::error::{CdcResult, ErrorKind};

/// Fails while a capture hook appends to the audit log.
pub const CAPTURE_BEFORE_APPEND: &str = "capture.before_append";
/// Fails after the target transaction committed and before the batch is marked as synced.
pub const REPLICATOR_AFTER_TARGET_COMMIT: &str = "replicator.after_target_commit";
/// Fails before a single record is applied to the target.
pub const REPLICATOR_BEFORE_APPLY: &str = "replicator.before_apply";

/// Returns an error when the named fail point is configured to `return`.
///
/// The optional parameter selects the error kind: `systemic` or `record`.
pub fn cdc_fail_point(name: &str) -> CdcResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            Some("record") => ErrorKind::WithRecordFailure,
            _ => ErrorKind::WithSystemicFailure,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
