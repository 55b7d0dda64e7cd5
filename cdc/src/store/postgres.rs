//! Audit store backed by a Postgres database.
//!
//! All audit objects live in the `cdc` schema: the change log, the apply-leases, the capture
//! registry and the trigger function shared by every captured table.

use std::time::Duration;

use cdc_config::shared::{IntoConnectOptions, PgConnectionConfig};
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool, PgPoolOptions, PgRow};
use sqlx::{Connection, Executor, Row};
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

const MAX_POOL_CONNECTIONS: u32 = 5;

/// Schema holding the audit objects and the migration history.
pub const CDC_SCHEMA: &str = "cdc";

const CHANGE_COLUMNS: &str = "id, table_name, operation, before_image, after_image, captured_at, \
     status, attempt_count, last_error, synced_at";

/// Postgres implementation of [`AuditStore`], [`LeaseStore`] and, through the capture module,
/// [`crate::capture::CaptureInstaller`].
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
    clock: SharedClock,
    max_attempts: u32,
}

impl PostgresStore {
    /// Wraps an existing pool. Call [`PostgresStore::migrate`] before first use.
    pub fn new(pool: PgPool, clock: SharedClock, max_attempts: u32) -> Self {
        Self {
            pool,
            clock,
            max_attempts,
        }
    }

    /// Connects with the given configuration and runs the audit migrations.
    pub async fn connect(config: &PgConnectionConfig, max_attempts: u32) -> CdcResult<Self> {
        Self::connect_with(config.connect_options(), max_attempts).await
    }

    pub async fn connect_with(options: PgConnectOptions, max_attempts: u32) -> CdcResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect_with(options)
            .await?;

        let store = Self::new(pool, SystemClock::shared(), max_attempts);
        store.migrate().await?;

        info!(
            host = store.pool.connect_options().get_host(),
            "connected to postgres audit store"
        );

        Ok(store)
    }

    /// Creates the `cdc` schema objects if they do not exist.
    ///
    /// Runs on a dedicated connection so the migration history table lands in the `cdc` schema
    /// without changing the search path of pooled connections.
    pub async fn migrate(&self) -> CdcResult<()> {
        let mut connection = PgConnection::connect_with(&self.pool.connect_options()).await?;

        connection
            .execute(format!("create schema if not exists {CDC_SCHEMA}").as_str())
            .await?;
        connection
            .execute(format!("set search_path = '{CDC_SCHEMA}'").as_str())
            .await?;

        sqlx::migrate!("./migrations/postgres")
            .run(&mut connection)
            .await?;

        connection.close().await?;

        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl AuditStore for PostgresStore {
    async fn append(&self, change: NewChange) -> CdcResult<ChangeId> {
        let row = sqlx::query(
            r#"
            insert into cdc.changes (table_name, operation, before_image, after_image, captured_at)
            values ($1, $2, $3, $4, $5)
            returning id
            "#,
        )
        .bind(&change.table_name)
        .bind(change.change.operation().as_str())
        .bind(change.change.before_image().map(sqlx::types::Json))
        .bind(change.change.after_image().map(sqlx::types::Json))
        .bind(self.clock.now())
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
            from cdc.changes
            where table_name = $1 and status in ('pending', 'failed')
            order by id
            limit $2
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

        verify_lease(&mut tx, lease, now).await?;

        let result = sqlx::query(
            r#"
            update cdc.changes
            set status = 'synced', synced_at = $1
            where table_name = $2
              and status in ('pending', 'failed')
              and id = any($3)
            "#,
        )
        .bind(now)
        .bind(&lease.table_name)
        .bind(ids)
        .execute(&mut *tx)
        .await?;

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

        verify_lease(&mut tx, lease, now).await?;

        let rows = sqlx::query(
            r#"
            update cdc.changes
            set attempt_count = attempt_count + 1,
                last_error = $1,
                status = case when attempt_count + 1 > $2 then 'dead_letter' else 'failed' end
            where table_name = $3
              and status in ('pending', 'failed')
              and id = any($4)
            returning id, attempt_count, status
            "#,
        )
        .bind(error)
        .bind(i32::try_from(self.max_attempts).unwrap_or(i32::MAX))
        .bind(&lease.table_name)
        .bind(ids)
        .fetch_all(&mut *tx)
        .await?;

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
            from cdc.changes
            where table_name = $1
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
            from cdc.changes
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
            "select {CHANGE_COLUMNS} from cdc.changes where id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(decode_change).transpose()
    }

    async fn requeue_dead_letters(&self, table_name: &str) -> CdcResult<u64> {
        let result = sqlx::query(
            r#"
            update cdc.changes
            set status = 'pending', attempt_count = 0
            where table_name = $1 and status = 'dead_letter'
            "#,
        )
        .bind(table_name)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

impl PostgresStore {
    /// Folds `(table_name, operation, status)` groups into per-table statistics.
    ///
    /// Rows must be ordered by table name.
    fn collect_statistics(&self, rows: &[PgRow]) -> CdcResult<Vec<TableStatistics>> {
        let now = self.clock.now();
        let mut all: Vec<TableStatistics> = Vec::new();

        for row in rows {
            let table_name: String = row.try_get("table_name")?;
            let operation: String = row.try_get("operation")?;
            let status: String = row.try_get("status")?;
            let count: i64 = row.try_get("change_count")?;
            let oldest: Option<DateTime<Utc>> = row.try_get("oldest_captured_at")?;

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
                statistics.observe_pending_age(elapsed_since(now, oldest));
            }
        }

        Ok(all)
    }
}

impl LeaseStore for PostgresStore {
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
            insert into cdc.apply_leases as lease (table_name, holder, fencing_token, expires_at)
            values ($1, $2, 1, $3)
            on conflict (table_name) do update
            set holder = excluded.holder,
                fencing_token = lease.fencing_token + 1,
                expires_at = excluded.expires_at
            where lease.expires_at <= $4
            returning fencing_token, expires_at
            "#,
        )
        .bind(table_name)
        .bind(holder.to_string())
        .bind(expires_at)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        Ok(Some(ApplyLease {
            table_name: table_name.to_string(),
            holder,
            fencing_token: row.try_get("fencing_token")?,
            expires_at: row.try_get("expires_at")?,
        }))
    }

    async fn release_lease(&self, lease: &ApplyLease) -> CdcResult<bool> {
        let result = sqlx::query(
            r#"
            update cdc.apply_leases
            set expires_at = $1
            where table_name = $2 and holder = $3 and fencing_token = $4
            "#,
        )
        .bind(self.clock.now())
        .bind(&lease.table_name)
        .bind(lease.holder.to_string())
        .bind(lease.fencing_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

/// Locks the lease row and checks that `lease` still owns it.
///
/// The row lock is held until the surrounding transaction ends, so a takeover cannot interleave
/// with the status update that follows.
async fn verify_lease(
    connection: &mut PgConnection,
    lease: &ApplyLease,
    now: DateTime<Utc>,
) -> CdcResult<()> {
    let row = sqlx::query(
        r#"
        select holder, fencing_token, expires_at
        from cdc.apply_leases
        where table_name = $1
        for update
        "#,
    )
    .bind(&lease.table_name)
    .fetch_optional(&mut *connection)
    .await?;

    let is_current = match row {
        Some(row) => {
            let holder: String = row.try_get("holder")?;
            is_current_lease(
                lease,
                &holder,
                row.try_get("fencing_token")?,
                row.try_get("expires_at")?,
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

fn decode_change(row: &PgRow) -> CdcResult<ChangeRecord> {
    let operation: String = row.try_get("operation")?;
    let before_image: Option<serde_json::Value> = row.try_get("before_image")?;
    let after_image: Option<serde_json::Value> = row.try_get("after_image")?;
    let status: String = row.try_get("status")?;

    Ok(ChangeRecord {
        id: row.try_get("id")?,
        table_name: row.try_get("table_name")?,
        change: RowChange::from_images(
            operation.parse()?,
            decode_image(before_image)?,
            decode_image(after_image)?,
        )?,
        captured_at: row.try_get("captured_at")?,
        status: status.parse()?,
        attempt_count: decode_attempt_count(row.try_get("attempt_count")?)?,
        last_error: row.try_get("last_error")?,
        synced_at: row.try_get("synced_at")?,
    })
}

fn decode_image(image: Option<serde_json::Value>) -> CdcResult<Option<RowImage>> {
    Ok(image
        .map(serde_json::from_value::<RowImage>)
        .transpose()?)
}

fn decode_attempt_count(attempt_count: i32) -> CdcResult<u32> {
    u32::try_from(attempt_count).map_err(|err| {
        cdc_error!(
            ErrorKind::InvalidData,
            "Invalid attempt count",
            format!("Attempt count {attempt_count} is out of range"),
            source: err
        )
    })
}
