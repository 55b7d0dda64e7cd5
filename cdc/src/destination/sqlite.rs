use cdc_config::shared::{IntoConnectOptions, SqliteConnectionConfig};
use serde_json::Value;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::{QueryBuilder, Sqlite, Transaction};
use tracing::info;

use crate::bail;
use crate::capture::sqlite::sqlite_identifier;
use crate::destination::{Destination, DestinationTransaction, classify_target_error};
use crate::error::{CdcResult, ErrorKind};
use crate::types::RowImage;

const MAX_POOL_CONNECTIONS: u32 = 4;

/// Destination that writes to tables of a SQLite database.
///
/// Target tables must exist and carry a primary or unique key on the replicated key columns.
#[derive(Debug, Clone)]
pub struct SqliteDestination {
    pool: SqlitePool,
}

impl SqliteDestination {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &SqliteConnectionConfig) -> CdcResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect_with(config.connect_options())
            .await
            .map_err(classify_target_error)?;

        info!(path = %config.path.display(), "connected to sqlite destination");

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl Destination for SqliteDestination {
    type Transaction = SqliteDestinationTransaction;

    fn name() -> &'static str {
        "sqlite"
    }

    async fn begin(&self) -> CdcResult<Self::Transaction> {
        let tx = self.pool.begin().await.map_err(classify_target_error)?;

        Ok(SqliteDestinationTransaction { tx })
    }

    async fn shutdown(&self) -> CdcResult<()> {
        self.pool.close().await;

        Ok(())
    }
}

#[derive(Debug)]
pub struct SqliteDestinationTransaction {
    tx: Transaction<'static, Sqlite>,
}

impl DestinationTransaction for SqliteDestinationTransaction {
    async fn upsert(
        &mut self,
        target_table: &str,
        key_columns: &[String],
        row: &RowImage,
    ) -> CdcResult<()> {
        if row.is_empty() {
            bail!(
                ErrorKind::InvalidData,
                "Row image has no columns",
                format!("Cannot upsert an empty row into '{target_table}'")
            );
        }

        let mut builder = QueryBuilder::<Sqlite>::new("insert into ");
        builder.push(sqlite_identifier(target_table)).push(" (");
        let mut columns = builder.separated(", ");
        for column in row.keys() {
            columns.push(sqlite_identifier(column));
        }
        builder.push(") values (");
        let mut values = builder.separated(", ");
        for value in row.values() {
            push_value(&mut values, value);
        }
        builder.push(") on conflict (");
        let mut keys = builder.separated(", ");
        for column in key_columns {
            keys.push(sqlite_identifier(column));
        }
        builder.push(")");

        let updated_columns: Vec<&String> = row
            .keys()
            .filter(|column| !key_columns.contains(column))
            .collect();
        if updated_columns.is_empty() {
            builder.push(" do nothing");
        } else {
            builder.push(" do update set ");
            let mut assignments = builder.separated(", ");
            for column in updated_columns {
                let column = sqlite_identifier(column);
                assignments.push(format!("{column} = excluded.{column}"));
            }
        }

        builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(classify_target_error)?;

        Ok(())
    }

    async fn delete(
        &mut self,
        target_table: &str,
        key_columns: &[String],
        key: &RowImage,
    ) -> CdcResult<()> {
        let mut builder = QueryBuilder::<Sqlite>::new("delete from ");
        builder.push(sqlite_identifier(target_table)).push(" where ");
        let mut predicates = builder.separated(" and ");
        for column in key_columns {
            let Some(value) = key.get(column) else {
                bail!(
                    ErrorKind::InvalidData,
                    "Row image is missing a key column",
                    format!("Key column '{column}' is absent from the delete image")
                );
            };
            predicates.push(format!("{} = ", sqlite_identifier(column)));
            push_value_unseparated(&mut predicates, value);
        }

        builder
            .build()
            .execute(&mut *self.tx)
            .await
            .map_err(classify_target_error)?;

        Ok(())
    }

    async fn commit(self) -> CdcResult<()> {
        self.tx.commit().await.map_err(classify_target_error)
    }

    async fn rollback(self) -> CdcResult<()> {
        self.tx.rollback().await.map_err(classify_target_error)
    }
}

type Separated<'b, 'args> = sqlx::query_builder::Separated<'b, 'args, Sqlite, &'static str>;

fn push_value(separated: &mut Separated<'_, '_>, value: &Value) {
    match value {
        Value::Null => separated.push_bind(None::<String>),
        Value::Bool(value) => separated.push_bind(*value),
        Value::Number(number) => match number.as_i64() {
            Some(value) => separated.push_bind(value),
            None => separated.push_bind(number.as_f64()),
        },
        Value::String(value) => separated.push_bind(value.clone()),
        other => separated.push_bind(other.to_string()),
    };
}

fn push_value_unseparated(separated: &mut Separated<'_, '_>, value: &Value) {
    match value {
        Value::Null => separated.push_bind_unseparated(None::<String>),
        Value::Bool(value) => separated.push_bind_unseparated(*value),
        Value::Number(number) => match number.as_i64() {
            Some(value) => separated.push_bind_unseparated(value),
            None => separated.push_bind_unseparated(number.as_f64()),
        },
        Value::String(value) => separated.push_bind_unseparated(value.clone()),
        other => separated.push_bind_unseparated(other.to_string()),
    };
}
