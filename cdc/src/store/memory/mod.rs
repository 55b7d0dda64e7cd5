//! In-process engine holding source tables, the audit log and the apply-leases.
//!
//! A single mutex serializes every operation, which plays the role of the source engine's
//! transaction isolation: a [`MemoryTransaction`] owns the lock until it commits or rolls back,
//! and capture hooks append to the audit log while it is held.

mod transaction;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cdc_config::shared::RetryConfig;
use tokio::sync::{Mutex, MutexGuard};
use uuid::Uuid;

use crate::bail;
use crate::capture::CaptureHandle;
use crate::clock::{SharedClock, SystemClock, elapsed_since};
use crate::error::{CdcResult, ErrorKind};
use crate::store::audit::AuditStore;
use crate::store::lease::{ApplyLease, LeaseStore, is_current_lease, lease_expiry, lease_lost};
use crate::types::{
    ChangeId, ChangeRecord, ChangeStatus, FailedChange, NewChange, RowImage, TableStatistics,
};
use crate::types::status_after_failure;

pub use transaction::MemoryTransaction;

#[derive(Debug)]
pub(crate) struct MemoryTable {
    pub(crate) columns: Vec<String>,
    pub(crate) key_columns: Vec<String>,
    pub(crate) rows: Vec<RowImage>,
}

#[derive(Debug)]
struct LeaseEntry {
    holder: Uuid,
    fencing_token: i64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug)]
pub(crate) struct Inner {
    pub(crate) tables: BTreeMap<String, MemoryTable>,
    pub(crate) captures: BTreeMap<String, CaptureHandle>,
    changes: BTreeMap<ChangeId, ChangeRecord>,
    next_change_id: ChangeId,
    leases: HashMap<String, LeaseEntry>,
}

impl Inner {
    pub(crate) fn append(&mut self, change: NewChange, now: DateTime<Utc>) -> ChangeId {
        self.next_change_id += 1;
        let id = self.next_change_id;

        self.changes.insert(
            id,
            ChangeRecord {
                id,
                table_name: change.table_name,
                change: change.change,
                captured_at: now,
                status: ChangeStatus::Pending,
                attempt_count: 0,
                last_error: None,
                synced_at: None,
            },
        );

        id
    }

    pub(crate) fn remove_change(&mut self, id: ChangeId) {
        self.changes.remove(&id);
    }

    fn check_lease(&self, lease: &ApplyLease, now: DateTime<Utc>) -> CdcResult<()> {
        let is_current = self.leases.get(&lease.table_name).is_some_and(|entry| {
            is_current_lease(
                lease,
                &entry.holder.to_string(),
                entry.fencing_token,
                entry.expires_at,
                now,
            )
        });

        if !is_current {
            return Err(lease_lost(lease));
        }

        Ok(())
    }
}

/// In-memory source database and audit store.
///
/// Cloning is cheap and every clone shares the same data.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<Mutex<Inner>>,
    clock: SharedClock,
    max_attempts: u32,
}

impl MemoryDatabase {
    /// Creates an empty database using the system clock and the default retry ceiling.
    pub fn new() -> Self {
        Self::with_clock(SystemClock::shared(), RetryConfig::DEFAULT_MAX_ATTEMPTS)
    }

    /// Creates an empty database with an explicit clock and retry ceiling.
    pub fn with_clock(clock: SharedClock, max_attempts: u32) -> Self {
        let inner = Inner {
            tables: BTreeMap::new(),
            captures: BTreeMap::new(),
            changes: BTreeMap::new(),
            next_change_id: 0,
            leases: HashMap::new(),
        };

        Self {
            inner: Arc::new(Mutex::new(inner)),
            clock,
            max_attempts,
        }
    }

    pub(crate) async fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().await
    }

    /// Creates a source table.
    ///
    /// `key_columns` may be empty, in which case the table cannot be captured.
    pub async fn create_table(
        &self,
        table_name: &str,
        columns: &[&str],
        key_columns: &[&str],
    ) -> CdcResult<()> {
        if let Some(column) = key_columns.iter().find(|key| !columns.contains(key)) {
            bail!(
                ErrorKind::InvalidData,
                "Key column is not a table column",
                format!("Column '{column}' is not part of table '{table_name}'")
            );
        }

        let mut inner = self.inner.lock().await;
        if inner.tables.contains_key(table_name) {
            bail!(
                ErrorKind::InvalidData,
                "Table already exists",
                format!("Table '{table_name}' already exists")
            );
        }

        inner.tables.insert(
            table_name.to_string(),
            MemoryTable {
                columns: columns.iter().map(|column| column.to_string()).collect(),
                key_columns: key_columns.iter().map(|column| column.to_string()).collect(),
                rows: Vec::new(),
            },
        );

        Ok(())
    }

    /// Starts a transaction. The database is locked until it commits or rolls back.
    pub async fn begin(&self) -> MemoryTransaction {
        let guard = self.inner.clone().lock_owned().await;
        MemoryTransaction::new(guard, self.clock.clone())
    }

    /// Inserts a row in its own transaction.
    pub async fn insert(&self, table_name: &str, row: RowImage) -> CdcResult<()> {
        let mut transaction = self.begin().await;
        transaction.insert(table_name, row)?;
        transaction.commit()
    }

    /// Updates the rows matching `filter` in their own transaction.
    pub async fn update(
        &self,
        table_name: &str,
        filter: &RowImage,
        assignments: RowImage,
    ) -> CdcResult<u64> {
        let mut transaction = self.begin().await;
        let updated = transaction.update(table_name, filter, assignments)?;
        transaction.commit()?;

        Ok(updated)
    }

    /// Deletes the rows matching `filter` in their own transaction.
    pub async fn delete(&self, table_name: &str, filter: &RowImage) -> CdcResult<u64> {
        let mut transaction = self.begin().await;
        let deleted = transaction.delete(table_name, filter)?;
        transaction.commit()?;

        Ok(deleted)
    }

    /// Returns a copy of the rows of a source table.
    pub async fn rows(&self, table_name: &str) -> CdcResult<Vec<RowImage>> {
        let inner = self.inner.lock().await;
        match inner.tables.get(table_name) {
            Some(table) => Ok(table.rows.clone()),
            None => bail!(
                ErrorKind::InvalidData,
                "Table does not exist",
                format!("Table '{table_name}' does not exist")
            ),
        }
    }
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl AuditStore for MemoryDatabase {
    async fn append(&self, change: NewChange) -> CdcResult<ChangeId> {
        let mut inner = self.inner.lock().await;

        Ok(inner.append(change, self.clock.now()))
    }

    async fn get_pending_changes(
        &self,
        table_name: &str,
        limit: usize,
    ) -> CdcResult<Vec<ChangeRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner
            .changes
            .values()
            .filter(|record| record.table_name == table_name && record.status.is_replicable())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_as_synced(&self, lease: &ApplyLease, ids: &[ChangeId]) -> CdcResult<u64> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.check_lease(lease, now)?;

        let mut synced = 0;
        for id in ids {
            if let Some(record) = inner.changes.get_mut(id)
                && record.table_name == lease.table_name
                && record.status.is_replicable()
            {
                record.status = ChangeStatus::Synced;
                record.synced_at = Some(now);
                synced += 1;
            }
        }

        Ok(synced)
    }

    async fn mark_as_failed(
        &self,
        lease: &ApplyLease,
        ids: &[ChangeId],
        error: &str,
    ) -> CdcResult<Vec<FailedChange>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;
        inner.check_lease(lease, now)?;

        let mut failed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = inner.changes.get_mut(id)
                && record.table_name == lease.table_name
                && record.status.is_replicable()
            {
                record.attempt_count += 1;
                record.last_error = Some(error.to_string());
                record.status = status_after_failure(record.attempt_count, self.max_attempts);
                failed.push(FailedChange {
                    id: record.id,
                    attempt_count: record.attempt_count,
                    status: record.status,
                });
            }
        }

        Ok(failed)
    }

    async fn get_statistics(&self, table_name: &str) -> CdcResult<TableStatistics> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        let mut statistics = TableStatistics::new(table_name);
        for record in inner
            .changes
            .values()
            .filter(|record| record.table_name == table_name)
        {
            add_record(&mut statistics, record, now);
        }

        Ok(statistics)
    }

    async fn get_all_statistics(&self) -> CdcResult<Vec<TableStatistics>> {
        let now = self.clock.now();
        let inner = self.inner.lock().await;

        let mut by_table: BTreeMap<&str, TableStatistics> = BTreeMap::new();
        for record in inner.changes.values() {
            let statistics = by_table
                .entry(record.table_name.as_str())
                .or_insert_with(|| TableStatistics::new(record.table_name.clone()));
            add_record(statistics, record, now);
        }

        Ok(by_table.into_values().collect())
    }

    async fn get_change(&self, id: ChangeId) -> CdcResult<Option<ChangeRecord>> {
        let inner = self.inner.lock().await;

        Ok(inner.changes.get(&id).cloned())
    }

    async fn requeue_dead_letters(&self, table_name: &str) -> CdcResult<u64> {
        let mut inner = self.inner.lock().await;

        let mut requeued = 0;
        for record in inner.changes.values_mut().filter(|record| {
            record.table_name == table_name && record.status == ChangeStatus::DeadLetter
        }) {
            record.status = ChangeStatus::Pending;
            record.attempt_count = 0;
            requeued += 1;
        }

        Ok(requeued)
    }
}

fn add_record(statistics: &mut TableStatistics, record: &ChangeRecord, now: DateTime<Utc>) {
    statistics.add(record.operation(), record.status, 1);
    if record.status.is_replicable() {
        statistics.observe_pending_age(elapsed_since(now, record.captured_at));
    }
}

impl LeaseStore for MemoryDatabase {
    async fn acquire_lease(
        &self,
        table_name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> CdcResult<Option<ApplyLease>> {
        let now = self.clock.now();
        let expires_at = lease_expiry(now, ttl);
        let mut inner = self.inner.lock().await;

        let fencing_token = match inner.leases.get_mut(table_name) {
            Some(entry) if entry.expires_at > now => return Ok(None),
            Some(entry) => {
                entry.holder = holder;
                entry.fencing_token += 1;
                entry.expires_at = expires_at;
                entry.fencing_token
            }
            None => {
                inner.leases.insert(
                    table_name.to_string(),
                    LeaseEntry {
                        holder,
                        fencing_token: 1,
                        expires_at,
                    },
                );
                1
            }
        };

        Ok(Some(ApplyLease {
            table_name: table_name.to_string(),
            holder,
            fencing_token,
            expires_at,
        }))
    }

    async fn release_lease(&self, lease: &ApplyLease) -> CdcResult<bool> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().await;

        match inner.leases.get_mut(&lease.table_name) {
            Some(entry) if entry.fencing_token == lease.fencing_token => {
                entry.expires_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
