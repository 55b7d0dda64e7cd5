//! Audit store backed by a SQLite database.
//!
//! The audit tables live in the same database as the captured tables, which is what lets the
//! capture triggers append inside the mutating transaction. Timestamps are stored as unix epoch
//! milliseconds.

use std::time::Duration;

use cdc_config::shared::{IntoConnectOptions, SqliteConnectionConfig};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use crate::cdc_error;
use crate::clock::{SharedClock, SystemClock, elapsed_since};
use crate::error::{CdcResult, ErrorKind};
use crate::store::audit::AuditStore;
use crate::store::lease::{ApplyLease, LeaseStore, is_current_lease, lease_expiry, lease_lost};
use crate::types::{
    ChangeId, ChangeRecord, ChangeStatus, FailedChange, NewChange, RowChange, RowImage,
    TableStatistics,
};

const MAX_POOL_CONNECTIONS: u32 = 4;

const CHANGE_COLUMNS: &str = "id, table_name, operation, before_image, after_image, captured_at, \
     status, attempt_count, last_error, synced_at";

/// SQLite implementation of [`AuditStore`], [`LeaseStore`] and, through the capture module,
/// [`crate::capture::CaptureInstaller`].
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
    clock: SharedClock,
    max_attempts: u32,
}

impl SqliteStore {
    /// Wraps an existing pool. Call [`SqliteStore::migrate`] before first use.
    pub fn new(pool: SqlitePool, clock: SharedClock, max_attempts: u32) -> Self {
        Self {
            pool,
            clock,
            max_attempts,
        }
    }

    /// Connects to the configured database file and runs the audit migrations.
    pub async fn connect(config: &SqliteConnectionConfig, max_attempts: u32) -> CdcResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect_with(config.connect_options())
            .await?;

        let store = Self::new(pool, SystemClock::shared(), max_attempts);
        store.migrate().await?;

        info!(path = %config.path.display(), "connected to sqlite audit store");

        Ok(store)
    }

    /// Creates the audit, lease and capture registry tables if they do not exist.
    pub async fn migrate(&self) -> CdcResult<()> {
        sqlx::migrate!("./migrations/sqlite").run(&self.pool).await?;

        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn clock(&self) -> &SharedClock {
        &self.clock
    }
}

impl AuditStore for SqliteStore {
    async fn append(&self, change: NewChange) -> CdcResult<ChangeId> {
        let before_image = encode_image(change.change.before_image())?;
        let after_image = encode_image(change.change.after_image())?;

        let row = sqlx::query(
            r#"
            insert into cdc_changes (table_name, operation, before_image, after_image, captured_at)
            values (?, ?, ?, ?, ?)
            returning id
            "#,
        )
        .bind(&change.table_name)
        .bind(change.change.operation().as_str())
        .bind(before_image)
        .bind(after_image)
        .bind(self.clock.now().timestamp_millis())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("id")?)
    }

    async fn get_pending_changes(
        &self,
        table_name: &str,
        limit: usize,
    ) -> CdcResult<Vec<ChangeRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            select {CHANGE_COLUMNS}
            from cdc_changes
            where table_name = ? and status in ('pending', 'failed')
            order by id
            limit ?
            "#
        ))
        .bind(table_name)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(decode_change).collect()
    }

    async fn mark_as_synced(&self, lease: &ApplyLease, ids: &[ChangeId]) -> CdcResult<u64> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            update cdc_changes
            set status = 'synced', synced_at = ?
            where table_name = ?
              and status in ('pending', 'failed')
              and id in (select value from json_each(?))
            "#,
        )
        .bind(now.timestamp_millis())
        .bind(&lease.table_name)
        .bind(serde_json::to_string(ids)?)
        .execute(&mut *tx)
        .await?;

        // The lease is checked after the write so the transaction already holds the write lock
        // and no other replicator can take the lease over before commit.
        verify_lease(&mut tx, lease, now).await?;
        tx.commit().await?;

        Ok(result.rows_affected())
    }

    async fn mark_as_failed(
        &self,
        lease: &ApplyLease,
        ids: &[ChangeId],
        error: &str,
    ) -> CdcResult<Vec<FailedChange>> {
        let now = self.clock.now();
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            update cdc_changes
            set attempt_count = attempt_count + 1,
                last_error = ?,
                status = case when attempt_count + 1 > ? then 'dead_letter' else 'failed' end
            where table_name = ?
              and status in ('pending', 'failed')
              and id in (select value from json_each(?))
            returning id, attempt_count, status
            "#,
        )
        .bind(error)
        .bind(i64::from(self.max_attempts))
        .bind(&lease.table_name)
        .bind(serde_json::to_string(ids)?)
        .fetch_all(&mut *tx)
        .await?;

        verify_lease(&mut tx, lease, now).await?;
        tx.commit().await?;

        let mut failed = rows
            .iter()
            .map(|row| {
                let status: String = row.try_get("status")?;
                Ok(FailedChange {
                    id: row.try_get("id")?,
                    attempt_count: decode_attempt_count(row.try_get("attempt_count")?)?,
                    status: status.parse()?,
                })
            })
            .collect::<CdcResult<Vec<_>>>()?;
        failed.sort_by_key(|change| change.id);

        Ok(failed)
    }

    async fn get_statistics(&self, table_name: &str) -> CdcResult<TableStatistics> {
        let rows = sqlx::query(
            r#"
            select table_name, operation, status, count(*) as change_count,
                   min(captured_at) as oldest_captured_at
            from cdc_changes
            where table_name = ?
            group by table_name, operation, status
            "#,
        )
        .bind(table_name)
        .fetch_all(&self.pool)
        .await?;

        let mut statistics = self.collect_statistics(&rows)?;

        Ok(statistics
            .pop()
            .unwrap_or_else(|| TableStatistics::new(table_name)))
    }

    async fn get_all_statistics(&self) -> CdcResult<Vec<TableStatistics>> {
        let rows = sqlx::query(
            r#"
            select table_name, operation, status, count(*) as change_count,
                   min(captured_at) as oldest_captured_at
            from cdc_changes
            group by table_name, operation, status
            order by table_name
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        self.collect_statistics(&rows)
    }

    async fn get_change(&self, id: ChangeId) -> CdcResult<Option<ChangeRecord>> {
        let row = sqlx::query(&format!(
            "select {CHANGE_COLUMNS} from cdc_changes where id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_change).transpose()
    }

    async fn requeue_dead_letters(&self, table_name: &str) -> CdcResult<u64> {
        let result = sqlx::query(
            r#"
            update cdc_changes
            set status = 'pending', attempt_count = 0
            where table_name = ? and status = 'dead_letter'
            "#,
        )
        .bind(table_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl SqliteStore {
    /// Folds `(table_name, operation, status)` groups into per-table statistics.
    ///
    /// Rows must be ordered by table name.
    fn collect_statistics(&self, rows: &[SqliteRow]) -> CdcResult<Vec<TableStatistics>> {
        let now = self.clock.now();
        let mut all: Vec<TableStatistics> = Vec::new();

        for row in rows {
            let table_name: String = row.try_get("table_name")?;
            let operation: String = row.try_get("operation")?;
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("change_count")?;
            let oldest: Option<i64> = row.try_get("oldest_captured_at")?;

            if all.last().is_none_or(|last| last.table_name != table_name) {
                all.push(TableStatistics::new(table_name));
            }
            let Some(statistics) = all.last_mut() else {
                continue;
            };

            let status: ChangeStatus = status.parse()?;
            statistics.add(operation.parse()?, status, u64::try_from(count).unwrap_or(0));
            if status.is_replicable()
                && let Some(oldest) = oldest
            {
                statistics.observe_pending_age(elapsed_since(now, from_epoch_millis(oldest)));
            }
        }

        Ok(all)
    }
}

impl LeaseStore for SqliteStore {
    async fn acquire_lease(
        &self,
        table_name: &str,
        holder: Uuid,
        ttl: Duration,
    ) -> CdcResult<Option<ApplyLease>> {
        let now = self.clock.now();
        let expires_at = lease_expiry(now, ttl);

        let row = sqlx::query(
            r#"
            insert into cdc_apply_leases (table_name, holder, fencing_token, expires_at)
            values (?, ?, 1, ?)
            on conflict (table_name) do update
            set holder = excluded.holder,
                fencing_token = cdc_apply_leases.fencing_token + 1,
                expires_at = excluded.expires_at
            where cdc_apply_leases.expires_at <= ?
            returning fencing_token
            "#,
        )
        .bind(table_name)
        .bind(holder.to_string())
        .bind(expires_at.timestamp_millis())
        .bind(now.timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ApplyLease {
            table_name: table_name.to_string(),
            holder,
            fencing_token: row.try_get("fencing_token")?,
            expires_at: from_epoch_millis(expires_at.timestamp_millis()),
        }))
    }

    async fn release_lease(&self, lease: &ApplyLease) -> CdcResult<bool> {
        let result = sqlx::query(
            r#"
            update cdc_apply_leases
            set expires_at = ?
            where table_name = ? and holder = ? and fencing_token = ?
            "#,
        )
        .bind(self.clock.now().timestamp_millis())
        .bind(&lease.table_name)
        .bind(lease.holder.to_string())
        .bind(lease.fencing_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

async fn verify_lease(
    connection: &mut SqliteConnection,
    lease: &ApplyLease,
    now: DateTime<Utc>,
) -> CdcResult<()> {
    let row = sqlx::query(
        "select holder, fencing_token, expires_at from cdc_apply_leases where table_name = ?",
    )
    .bind(&lease.table_name)
    .fetch_optional(&mut *connection)
    .await?;

    let is_current = match row {
        Some(row) => {
            let holder: String = row.try_get("holder")?;
            let fencing_token: i64 = row.try_get("fencing_token")?;
            let expires_at: i64 = row.try_get("expires_at")?;
            is_current_lease(
                lease,
                &holder,
                fencing_token,
                from_epoch_millis(expires_at),
                now,
            )
        }
        None => false,
    };

    if !is_current {
        return Err(lease_lost(lease));
    }

    Ok(())
}

fn decode_change(row: &SqliteRow) -> CdcResult<ChangeRecord> {
    let operation: String = row.try_get("operation")?;
    let before_image: Option<String> = row.try_get("before_image")?;
    let after_image: Option<String> = row.try_get("after_image")?;
    let status: String = row.try_get("status")?;
    let captured_at: i64 = row.try_get("captured_at")?;
    let synced_at: Option<i64> = row.try_get("synced_at")?;

    Ok(ChangeRecord {
        id: row.try_get("id")?,
        table_name: row.try_get("table_name")?,
        change: RowChange::from_images(
            operation.parse()?,
            decode_image(before_image)?,
            decode_image(after_image)?,
        )?,
        captured_at: from_epoch_millis(captured_at),
        status: status.parse()?,
        attempt_count: decode_attempt_count(row.try_get("attempt_count")?)?,
        last_error: row.try_get("last_error")?,
        synced_at: synced_at.map(from_epoch_millis),
    })
}

fn encode_image(image: Option<&RowImage>) -> CdcResult<Option<String>> {
    Ok(image.map(serde_json::to_string).transpose()?)
}

fn decode_image(image: Option<String>) -> CdcResult<Option<RowImage>> {
    Ok(image
        .map(|image| serde_json::from_str::<RowImage>(&image))
        .transpose()?)
}

fn decode_attempt_count(attempt_count: i64) -> CdcResult<u32> {
    u32::try_from(attempt_count).map_err(|err| {
        cdc_error!(
            ErrorKind::InvalidData,
            "Invalid attempt count",
            format!("Attempt count {attempt_count} is out of range"),
            source: err
        )
    })
}

fn from_epoch_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}
