use std::collections::BTreeMap;

use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::capture::CaptureHandle;
use crate::destination::{Destination, DestinationTransaction};
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::failpoints::{REPLICATOR_AFTER_TARGET_COMMIT, REPLICATOR_BEFORE_APPLY, cdc_fail_point};
use crate::replication::context::CdcContext;
use crate::replication::outcome::BatchOutcome;
use crate::replication::policy::{RetryDirective, build_error_handling_policy};
use crate::store::{ApplyLease, AuditStore, LeaseStore};
use crate::types::{ChangeId, ChangeRecord, RowChange, RowKey};
use crate::{bail, cdc_error};

/// A captured source table and the target table its changes are applied to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicatedTable {
    pub source_table: String,
    pub target_table: String,
    /// Columns target writes are keyed on.
    pub key_columns: Vec<String>,
}

impl ReplicatedTable {
    pub fn new(
        source_table: impl Into<String>,
        target_table: impl Into<String>,
        key_columns: Vec<String>,
    ) -> Self {
        Self {
            source_table: source_table.into(),
            target_table: target_table.into(),
            key_columns,
        }
    }

    /// Replicates a captured table into `target_table`, or into a table of the same name.
    pub fn from_handle(handle: &CaptureHandle, target_table: Option<&str>) -> Self {
        Self::new(
            handle.table_name.clone(),
            target_table.unwrap_or(&handle.table_name),
            handle.key_columns.clone(),
        )
    }
}

/// Drains pending change records of registered tables into a destination.
///
/// Each pass over a table runs under the table's apply-lease, so several replicators can share
/// an audit store without applying the same batch twice.
#[derive(Debug)]
pub struct Replicator<S, D> {
    context: CdcContext<S, D>,
    holder: Uuid,
    tables: BTreeMap<String, ReplicatedTable>,
}

impl<S, D> Replicator<S, D>
where
    S: AuditStore + LeaseStore + Sync,
    D: Destination + Sync,
{
    /// Creates a replicator with a random lease holder id.
    pub fn new(context: CdcContext<S, D>) -> Self {
        Self::with_holder(context, Uuid::new_v4())
    }

    pub fn with_holder(context: CdcContext<S, D>, holder: Uuid) -> Self {
        Self {
            context,
            holder,
            tables: BTreeMap::new(),
        }
    }

    pub fn context(&self) -> &CdcContext<S, D> {
        &self.context
    }

    pub fn holder(&self) -> Uuid {
        self.holder
    }

    /// Registers a table, replacing any previous registration of the same source table.
    pub fn register_table(&mut self, table: ReplicatedTable) {
        info!(
            source_table = %table.source_table,
            target_table = %table.target_table,
            destination = D::name(),
            "registered table for replication"
        );
        self.tables.insert(table.source_table.clone(), table);
    }

    pub fn tables(&self) -> impl Iterator<Item = &ReplicatedTable> {
        self.tables.values()
    }

    /// Runs one replication pass over `table_name`, applying at most `batch_size` records.
    ///
    /// The batch is applied in id order inside a single target transaction. A record-level
    /// failure rolls the whole batch back and marks only the offending record, a systemic one
    /// rolls it back without marking anything. The lease is released whatever the outcome.
    pub async fn replicate_changes(
        &self,
        table_name: &str,
        batch_size: usize,
    ) -> CdcResult<BatchOutcome> {
        let Some(table) = self.tables.get(table_name) else {
            bail!(
                ErrorKind::TableNotRegistered,
                "Table is not registered for replication",
                format!("Table '{table_name}' was never registered with the replicator")
            );
        };

        let ttl = self.context.config.lease.timeout();
        let Some(lease) = self
            .context
            .store
            .acquire_lease(table_name, self.holder, ttl)
            .await?
        else {
            debug!(table_name, "apply-lease is held by another replicator");
            return Ok(BatchOutcome::LeaseUnavailable);
        };

        let result = self.replicate_under_lease(table, &lease, batch_size).await;

        if let Err(err) = self.context.store.release_lease(&lease).await {
            warn!(table_name, error = %err, "failed to release apply-lease");
        }

        let finished_at = self.context.clock.now();
        match &result {
            Ok(outcome) => {
                self.context
                    .outcomes
                    .record(table_name, finished_at, outcome)
                    .await
            }
            Err(_) => {
                self.context
                    .outcomes
                    .record_error(table_name, finished_at)
                    .await
            }
        }

        result
    }

    /// Runs one pass over every registered table.
    ///
    /// Every table is attempted even when an earlier one fails; the failures are returned
    /// together.
    pub async fn replicate_all(
        &self,
        batch_size: usize,
    ) -> CdcResult<BTreeMap<String, BatchOutcome>> {
        let mut outcomes = BTreeMap::new();
        let mut errors = Vec::new();

        for table_name in self.tables.keys() {
            match self.replicate_changes(table_name, batch_size).await {
                Ok(outcome) => {
                    outcomes.insert(table_name.clone(), outcome);
                }
                Err(err) => errors.push(err),
            }
        }

        if !errors.is_empty() {
            return Err(errors.into());
        }

        Ok(outcomes)
    }

    async fn replicate_under_lease(
        &self,
        table: &ReplicatedTable,
        lease: &ApplyLease,
        batch_size: usize,
    ) -> CdcResult<BatchOutcome> {
        let table_name = table.source_table.as_str();
        let changes = self
            .context
            .store
            .get_pending_changes(table_name, batch_size)
            .await?;
        if changes.is_empty() {
            return Ok(BatchOutcome::Idle);
        }

        let mut tx = match self.context.destination.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                warn!(table_name, error = %err, "failed to open target transaction");
                return Ok(BatchOutcome::Aborted { error: err });
            }
        };

        for change in &changes {
            if let Err(err) = apply_change(&mut tx, table, change).await {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(table_name, error = %rollback_err, "failed to roll back target transaction");
                }

                return self.handle_apply_error(table_name, lease, change, err).await;
            }
        }

        if let Err(err) = tx.commit().await {
            warn!(table_name, error = %err, "failed to commit target transaction");
            return Ok(BatchOutcome::Aborted { error: err });
        }

        cdc_fail_point(REPLICATOR_AFTER_TARGET_COMMIT)?;

        let ids: Vec<ChangeId> = changes.iter().map(|change| change.id).collect();
        match self.context.store.mark_as_synced(lease, &ids).await {
            Ok(count) => {
                info!(table_name, count, "replicated batch");
                Ok(BatchOutcome::Synced { count })
            }
            Err(err) if err.kind() == ErrorKind::LeaseLost => {
                warn!(
                    table_name,
                    applied = ids.len(),
                    "apply-lease lost after target commit, batch will be applied again"
                );
                Ok(BatchOutcome::LeaseLost {
                    applied: u64::try_from(ids.len()).unwrap_or(u64::MAX),
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn handle_apply_error(
        &self,
        table_name: &str,
        lease: &ApplyLease,
        change: &ChangeRecord,
        err: CdcError,
    ) -> CdcResult<BatchOutcome> {
        let policy = build_error_handling_policy(&err);

        if policy.retry_directive() == RetryDirective::Systemic {
            warn!(table_name, change_id = change.id, error = %err, "batch aborted by systemic failure");
            return Ok(BatchOutcome::Aborted { error: err });
        }

        let failed = match self
            .context
            .store
            .mark_as_failed(lease, &[change.id], &err.summary())
            .await
        {
            Ok(failed) => failed,
            Err(mark_err) if mark_err.kind() == ErrorKind::LeaseLost => {
                warn!(table_name, change_id = change.id, "apply-lease lost before marking failed record");
                return Ok(BatchOutcome::Aborted { error: mark_err });
            }
            Err(mark_err) => return Err(mark_err),
        };

        let Some(failed) = failed.into_iter().next() else {
            // The record left the replicable statuses in the meantime.
            return Ok(BatchOutcome::Aborted { error: err });
        };

        let dead_lettered = failed.is_dead_letter();
        if dead_lettered {
            let exhausted = cdc_error!(
                ErrorKind::RetriesExhausted,
                "Change record exhausted its retries",
                format!(
                    "Change {} of table '{table_name}' was dead-lettered after {} attempts",
                    failed.id, failed.attempt_count
                ),
                source: err
            );
            error!(
                table_name,
                change_id = failed.id,
                solution = policy.solution(),
                error = %exhausted,
                "change record moved to dead letter"
            );
        } else {
            warn!(
                table_name,
                change_id = failed.id,
                attempt_count = failed.attempt_count,
                error = %err,
                "change record failed to apply"
            );
        }

        Ok(BatchOutcome::RecordFailed {
            change_id: failed.id,
            attempt_count: failed.attempt_count,
            dead_lettered,
        })
    }
}

/// Applies one change record inside the open target transaction.
///
/// An update that moved the row to a new key removes the row under the old key first.
async fn apply_change<T>(tx: &mut T, table: &ReplicatedTable, change: &ChangeRecord) -> CdcResult<()>
where
    T: DestinationTransaction + Send,
{
    cdc_fail_point(REPLICATOR_BEFORE_APPLY)?;

    let target = table.target_table.as_str();
    let keys = table.key_columns.as_slice();
    match &change.change {
        RowChange::Insert { after } => tx.upsert(target, keys, after).await,
        RowChange::Update { before, after } => {
            if RowKey::from_image(before, keys)? != RowKey::from_image(after, keys)? {
                tx.delete(target, keys, before).await?;
            }
            tx.upsert(target, keys, after).await
        }
        RowChange::Delete { before } => tx.delete(target, keys, before).await,
    }
}
