use cdc_config::shared::{IntoConnectOptions, PgConnectionConfig};
use pg_escape::quote_identifier;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use tracing::info;

use crate::bail;
use crate::capture::postgres::quote_table_name;
use crate::destination::{Destination, DestinationTransaction, classify_target_error};
use crate::error::{CdcResult, ErrorKind};
use crate::types::RowImage;

const MAX_POOL_CONNECTIONS: u32 = 5;

/// Destination that writes to tables of a Postgres database.
///
/// Row images are converted to the target column types by `jsonb_populate_record`, so the
/// target tables must exist with a primary or unique key on the replicated key columns.
#[derive(Debug, Clone)]
pub struct PostgresDestination {
    pool: PgPool,
}

impl PostgresDestination {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &PgConnectionConfig) -> CdcResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect_with(config.connect_options())
            .await
            .map_err(classify_target_error)?;

        info!(host = %config.host, database = %config.name, "connected to postgres destination");

        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl Destination for PostgresDestination {
    type Transaction = PostgresDestinationTransaction;

    fn name() -> &'static str {
        "postgres"
    }

    async fn begin(&self) -> CdcResult<Self::Transaction> {
        let tx = self.pool.begin().await.map_err(classify_target_error)?;

        Ok(PostgresDestinationTransaction { tx })
    }

    async fn shutdown(&self) -> CdcResult<()> {
        self.pool.close().await;

        Ok(())
    }
}

#[derive(Debug)]
pub struct PostgresDestinationTransaction {
    tx: Transaction<'static, Postgres>,
}

impl DestinationTransaction for PostgresDestinationTransaction {
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

        let statement = upsert_statement(target_table, key_columns, row);
        sqlx::query(&statement)
            .bind(Json(row))
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
        let statement = delete_statement(target_table, key_columns);
        sqlx::query(&statement)
            .bind(Json(key))
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

fn join_identifiers<'a>(columns: impl IntoIterator<Item = &'a String>) -> String {
    columns
        .into_iter()
        .map(|column| quote_identifier(column).to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn upsert_statement(target_table: &str, key_columns: &[String], row: &RowImage) -> String {
    let table = quote_table_name(target_table);
    let columns = join_identifiers(row.keys());
    let conflict = match row
        .keys()
        .filter(|column| !key_columns.contains(column))
        .map(|column| {
            let column = quote_identifier(column);
            format!("{column} = excluded.{column}")
        })
        .collect::<Vec<_>>()
    {
        assignments if assignments.is_empty() => "do nothing".to_string(),
        assignments => format!("do update set {}", assignments.join(", ")),
    };

    format!(
        "insert into {table} ({columns}) select {columns} from jsonb_populate_record(null::{table}, $1) on conflict ({}) {conflict}",
        join_identifiers(key_columns)
    )
}

fn delete_statement(target_table: &str, key_columns: &[String]) -> String {
    let table = quote_table_name(target_table);
    let predicates = key_columns
        .iter()
        .map(|column| {
            let column = quote_identifier(column);
            format!("target.{column} = source.{column}")
        })
        .collect::<Vec<_>>()
        .join(" and ");

    format!(
        "delete from {table} as target using jsonb_populate_record(null::{table}, $1) as source where {predicates}"
    )
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::row_image;

    #[test]
    fn upsert_updates_non_key_columns() {
        let row = row_image([("id", json!(1)), ("name", json!("Ana"))]);
        let statement = upsert_statement("users", &["id".to_string()], &row);

        assert_eq!(
            statement,
            "insert into users (id, name) select id, name from jsonb_populate_record(null::users, $1) \
             on conflict (id) do update set name = excluded.name"
        );
    }

    #[test]
    fn upsert_of_key_only_row_does_nothing_on_conflict() {
        let row = row_image([("id", json!(1))]);
        let statement = upsert_statement("users", &["id".to_string()], &row);

        assert!(statement.ends_with("on conflict (id) do nothing"));
    }

    #[test]
    fn delete_matches_every_key_column() {
        let statement = delete_statement("orders", &["region".to_string(), "id".to_string()]);

        assert!(statement.ends_with("where target.region = source.region and target.id = source.id"));
    }
}
