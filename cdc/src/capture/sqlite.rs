use sqlx::sqlite::SqliteConnection;
use sqlx::Row;
use tracing::info;

use crate::capture::base::{
    CaptureHandle, CaptureInstaller, KeyCandidate, choose_capture_key, resolve_tracked_columns,
    validate_table_name,
};
use crate::clock::Clock;
use crate::error::{CdcResult, ErrorKind};
use crate::store::sqlite::SqliteStore;
use crate::types::Operation;
use crate::{bail, cdc_error};

const CAPTURED_OPERATIONS: [Operation; 3] =
    [Operation::Insert, Operation::Update, Operation::Delete];

/// Column of a SQLite table as reported by `pragma_table_info`.
#[derive(Debug)]
struct TableColumn {
    name: String,
    not_null: bool,
    /// 1-based position in the primary key, 0 when not part of it.
    primary_key_position: i64,
}

impl CaptureInstaller for SqliteStore {
    async fn setup_capture(
        &self,
        table_name: &str,
        tracked_columns: &[&str],
    ) -> CdcResult<CaptureHandle> {
        validate_table_name(table_name)?;
        let mut tx = self.pool().begin().await?;

        if let Some(handle) = fetch_handle(&mut tx, table_name).await? {
            return Ok(handle);
        }

        let columns = fetch_table_columns(&mut tx, table_name).await?;
        if columns.is_empty() {
            bail!(
                ErrorKind::SetupFailed,
                "Table does not exist",
                format!("Table '{table_name}' does not exist")
            );
        }

        let candidates = fetch_key_candidates(&mut tx, table_name, &columns).await?;
        let key_columns = choose_capture_key(table_name, &candidates)?;
        let column_names: Vec<String> = columns.into_iter().map(|column| column.name).collect();
        let tracked_columns =
            resolve_tracked_columns(table_name, &column_names, &key_columns, tracked_columns)?;

        for operation in CAPTURED_OPERATIONS {
            let statement = create_trigger_statement(table_name, operation, &tracked_columns);
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|err| {
                    cdc_error!(
                        ErrorKind::SetupFailed,
                        "Failed to install capture trigger",
                        format!("Could not create the {operation} trigger on table '{table_name}'"),
                        source: err
                    )
                })?;
        }

        sqlx::query(
            r#"
            insert into cdc_captured_tables (table_name, key_columns, tracked_columns, installed_at)
            values (?, ?, ?, ?)
            "#,
        )
        .bind(table_name)
        .bind(serde_json::to_string(&key_columns)?)
        .bind(serde_json::to_string(&tracked_columns)?)
        .bind(self.clock().now().timestamp_millis())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(table_name, ?key_columns, "installed sqlite capture triggers");

        Ok(CaptureHandle {
            table_name: table_name.to_string(),
            key_columns,
            tracked_columns,
        })
    }

    async fn remove_capture(&self, table_name: &str) -> CdcResult<bool> {
        let mut tx = self.pool().begin().await?;

        for operation in CAPTURED_OPERATIONS {
            let statement = format!(
                "drop trigger if exists {}",
                sqlite_identifier(&trigger_name(table_name, operation))
            );
            sqlx::query(&statement).execute(&mut *tx).await?;
        }

        let result = sqlx::query("delete from cdc_captured_tables where table_name = ?")
            .bind(table_name)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!(table_name, "removed sqlite capture triggers");
        }

        Ok(removed)
    }

    async fn captured_tables(&self) -> CdcResult<Vec<CaptureHandle>> {
        let rows = sqlx::query(
            "select table_name, key_columns, tracked_columns from cdc_captured_tables order by table_name",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter()
            .map(|row| {
                let key_columns: String = row.try_get("key_columns")?;
                let tracked_columns: String = row.try_get("tracked_columns")?;
                Ok(CaptureHandle {
                    table_name: row.try_get("table_name")?,
                    key_columns: serde_json::from_str(&key_columns)?,
                    tracked_columns: serde_json::from_str(&tracked_columns)?,
                })
            })
            .collect()
    }
}

async fn fetch_handle(
    connection: &mut SqliteConnection,
    table_name: &str,
) -> CdcResult<Option<CaptureHandle>> {
    let row = sqlx::query(
        "select key_columns, tracked_columns from cdc_captured_tables where table_name = ?",
    )
    .bind(table_name)
    .fetch_optional(&mut *connection)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let key_columns: String = row.try_get("key_columns")?;
    let tracked_columns: String = row.try_get("tracked_columns")?;

    Ok(Some(CaptureHandle {
        table_name: table_name.to_string(),
        key_columns: serde_json::from_str(&key_columns)?,
        tracked_columns: serde_json::from_str(&tracked_columns)?,
    }))
}

async fn fetch_table_columns(
    connection: &mut SqliteConnection,
    table_name: &str,
) -> CdcResult<Vec<TableColumn>> {
    let rows = sqlx::query(
        r#"select name, type, "notnull" as not_null, pk from pragma_table_info(?) order by cid"#,
    )
    .bind(table_name)
    .fetch_all(&mut *connection)
    .await?;

    let mut columns = Vec::with_capacity(rows.len());
    let mut declared_types = Vec::with_capacity(rows.len());
    for row in &rows {
        let not_null: i64 = row.try_get("not_null")?;
        declared_types.push(row.try_get::<String, _>("type")?);
        columns.push(TableColumn {
            name: row.try_get("name")?,
            not_null: not_null != 0,
            primary_key_position: row.try_get("pk")?,
        });
    }

    // A lone INTEGER PRIMARY KEY aliases the rowid and can never hold NULL. Any other primary key
    // column accepts NULL unless declared NOT NULL.
    let mut primary_key = columns
        .iter_mut()
        .zip(&declared_types)
        .filter(|(column, _)| column.primary_key_position > 0);
    if let (Some((column, declared_type)), None) = (primary_key.next(), primary_key.next())
        && declared_type.eq_ignore_ascii_case("integer")
    {
        column.not_null = true;
    }

    Ok(columns)
}

/// Lists the primary key and the full unique indexes of a table.
///
/// Partial indexes and indexes over expressions cannot key a row and are skipped. Unique indexes
/// are considered in name order.
async fn fetch_key_candidates(
    connection: &mut SqliteConnection,
    table_name: &str,
    columns: &[TableColumn],
) -> CdcResult<Vec<KeyCandidate>> {
    let mut candidates = Vec::new();

    let mut primary_key: Vec<&TableColumn> = columns
        .iter()
        .filter(|column| column.primary_key_position > 0)
        .collect();
    primary_key.sort_by_key(|column| column.primary_key_position);
    if !primary_key.is_empty() {
        candidates.push(KeyCandidate {
            is_primary: true,
            columns: primary_key.iter().map(|column| column.name.clone()).collect(),
            all_not_null: primary_key.iter().all(|column| column.not_null),
        });
    }

    let indexes = sqlx::query(
        r#"
        select name from pragma_index_list(?)
        where "unique" = 1 and partial = 0
        order by name
        "#,
    )
    .bind(table_name)
    .fetch_all(&mut *connection)
    .await?;

    for index in indexes {
        let index_name: String = index.try_get("name")?;
        let index_columns = sqlx::query("select name from pragma_index_info(?) order by seqno")
            .bind(&index_name)
            .fetch_all(&mut *connection)
            .await?
            .iter()
            .map(|row| row.try_get::<Option<String>, _>("name"))
            .collect::<Result<Option<Vec<String>>, _>>()?;

        let Some(index_columns) = index_columns else {
            continue;
        };

        let all_not_null = index_columns.iter().all(|name| {
            columns
                .iter()
                .any(|column| &column.name == name && column.not_null)
        });

        candidates.push(KeyCandidate {
            is_primary: false,
            columns: index_columns,
            all_not_null,
        });
    }

    Ok(candidates)
}

fn trigger_name(table_name: &str, operation: Operation) -> String {
    format!(
        "cdc_{table_name}_after_{}",
        operation.as_str().to_lowercase()
    )
}

/// Builds the `after` trigger that appends a change record for every affected row.
fn create_trigger_statement(
    table_name: &str,
    operation: Operation,
    tracked_columns: &[String],
) -> String {
    let image = |alias: &str| {
        let pairs = tracked_columns
            .iter()
            .map(|column| {
                format!(
                    "{}, {alias}.{}",
                    sqlite_literal(column),
                    sqlite_identifier(column)
                )
            })
            .collect::<Vec<_>>()
            .join(", ");
        format!("json_object({pairs})")
    };

    let (before_image, after_image) = match operation {
        Operation::Insert => ("null".to_string(), image("new")),
        Operation::Update => (image("old"), image("new")),
        Operation::Delete => (image("old"), "null".to_string()),
    };

    format!(
        r#"
        create trigger if not exists {trigger} after {event} on {table} for each row
        begin
            insert into cdc_changes (table_name, operation, before_image, after_image)
            values ({table_literal}, {operation_literal}, {before_image}, {after_image});
        end
        "#,
        trigger = sqlite_identifier(&trigger_name(table_name, operation)),
        event = operation.as_str().to_lowercase(),
        table = sqlite_identifier(table_name),
        table_literal = sqlite_literal(table_name),
        operation_literal = sqlite_literal(operation.as_str()),
    )
}

/// Quotes a SQLite identifier, doubling embedded quotes.
pub(crate) fn sqlite_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quotes a SQLite string literal, doubling embedded quotes.
pub(crate) fn sqlite_literal(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}
