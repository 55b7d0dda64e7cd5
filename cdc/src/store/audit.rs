use std::future::Future;

use crate::error::CdcResult;
use crate::store::lease::ApplyLease;
use crate::types::{ChangeId, ChangeRecord, FailedChange, NewChange, TableStatistics};

/// Durable, ordered log of captured changes and their replication status.
///
/// Records of a table are read in ascending id order and are never deleted through this trait.
/// Status updates are compare-and-set: they only touch records that are still replicable and only
/// when the caller's [`ApplyLease`] is still current, otherwise they fail with
/// [`crate::error::ErrorKind::LeaseLost`] without changing anything.
pub trait AuditStore {
    /// Appends a change with status pending and returns its id.
    ///
    /// Capture hooks installed in SQL engines append from inside the triggering transaction and
    /// do not go through this method.
    fn append(&self, change: NewChange) -> impl Future<Output = CdcResult<ChangeId>> + Send;

    /// Returns up to `limit` pending or failed records of `table_name`, in ascending id order.
    fn get_pending_changes(
        &self,
        table_name: &str,
        limit: usize,
    ) -> impl Future<Output = CdcResult<Vec<ChangeRecord>>> + Send;

    /// Marks records as synced and returns how many of them transitioned.
    ///
    /// Records that are already synced are left untouched, so calling this twice with the same ids
    /// is not an error.
    fn mark_as_synced(
        &self,
        lease: &ApplyLease,
        ids: &[ChangeId],
    ) -> impl Future<Output = CdcResult<u64>> + Send;

    /// Records a failed attempt for each id.
    ///
    /// The attempt count is incremented and the error stored. A record whose attempt count exceeds
    /// the store's configured ceiling becomes dead letter, otherwise it stays retryable.
    fn mark_as_failed(
        &self,
        lease: &ApplyLease,
        ids: &[ChangeId],
        error: &str,
    ) -> impl Future<Output = CdcResult<Vec<FailedChange>>> + Send;

    /// Returns the statistics of one table.
    fn get_statistics(
        &self,
        table_name: &str,
    ) -> impl Future<Output = CdcResult<TableStatistics>> + Send;

    /// Returns the statistics of every table that has records, ordered by table name.
    fn get_all_statistics(&self) -> impl Future<Output = CdcResult<Vec<TableStatistics>>> + Send;

    /// Returns a single record.
    fn get_change(
        &self,
        id: ChangeId,
    ) -> impl Future<Output = CdcResult<Option<ChangeRecord>>> + Send;

    /// Moves the dead letter records of a table back to pending with a reset attempt count.
    ///
    /// This is the operator's recovery path and is never called by the replication engine.
    fn requeue_dead_letters(&self, table_name: &str) -> impl Future<Output = CdcResult<u64>> + Send;
}
