use std::future::Future;

use crate::cdc_error;
use crate::error::{CdcError, CdcResult, ErrorKind, is_connectivity_error};
use crate::types::RowImage;

/// Trait for systems that replicated changes are applied to.
///
/// A batch of changes is applied through one [`DestinationTransaction`]: either all of its writes
/// become visible on [`DestinationTransaction::commit`] or none do. Writes are keyed on the
/// captured key columns and must be idempotent, since a batch whose status update failed after
/// the target commit is applied again.
///
/// The trait also provides an optional [`Destination::shutdown`] method with a default no-op
/// implementation. Override this method if your destination requires cleanup when the replicator
/// shuts down.
pub trait Destination {
    type Transaction: DestinationTransaction + Send;

    /// Returns the name of the destination.
    fn name() -> &'static str;

    /// Starts a transaction on the target.
    ///
    /// Fails with [`ErrorKind::TargetConnectionFailed`] when the target is unreachable.
    fn begin(&self) -> impl Future<Output = CdcResult<Self::Transaction>> + Send;

    /// Propagates the shutdown signal to the destination.
    fn shutdown(&self) -> impl Future<Output = CdcResult<()>> + Send {
        async { Ok(()) }
    }
}

/// Open transaction on a [`Destination`].
pub trait DestinationTransaction {
    /// Inserts `row` or, when a row with the same key exists, overwrites its columns.
    fn upsert(
        &mut self,
        target_table: &str,
        key_columns: &[String],
        row: &RowImage,
    ) -> impl Future<Output = CdcResult<()>> + Send;

    /// Deletes the row whose key columns match `key`. Deleting a missing row is not an error.
    fn delete(
        &mut self,
        target_table: &str,
        key_columns: &[String],
        key: &RowImage,
    ) -> impl Future<Output = CdcResult<()>> + Send;

    /// Makes every write of the transaction visible.
    fn commit(self) -> impl Future<Output = CdcResult<()>> + Send;

    /// Discards every write of the transaction.
    fn rollback(self) -> impl Future<Output = CdcResult<()>> + Send;
}

/// Maps a target database error to a target error kind.
///
/// Connectivity problems are systemic and leave the batch untouched, anything else is blamed on
/// the change being applied.
pub(crate) fn classify_target_error(err: sqlx::Error) -> CdcError {
    if is_connectivity_error(&err) {
        cdc_error!(
            ErrorKind::TargetConnectionFailed,
            "Target database is unreachable",
            source: err
        )
    } else {
        cdc_error!(
            ErrorKind::ApplyFailed,
            "Failed to apply change to target",
            err.to_string(),
            source: err
        )
    }
}
