use pg_escape::{quote_identifier, quote_literal};
use sqlx::postgres::PgConnection;
use sqlx::Row;
use tracing::info;

use crate::capture::base::{
    CaptureHandle, CaptureInstaller, KeyCandidate, choose_capture_key, resolve_tracked_columns,
    validate_table_name,
};
use crate::error::{CdcResult, ErrorKind};
use crate::store::postgres::PostgresStore;
use crate::{bail, cdc_error};

/// Longest identifier Postgres keeps without truncation.
const MAX_IDENTIFIER_LENGTH: usize = 63;

impl CaptureInstaller for PostgresStore {
    async fn setup_capture(
        &self,
        table_name: &str,
        tracked_columns: &[&str],
    ) -> CdcResult<CaptureHandle> {
        validate_table_name(table_name)?;
        let relation = quote_table_name(table_name);
        let mut tx = self.pool().begin().await?;

        if let Some(handle) = fetch_handle(&mut tx, table_name).await? {
            return Ok(handle);
        }

        let exists: bool = sqlx::query("select to_regclass($1) is not null as table_exists")
            .bind(&relation)
            .fetch_one(&mut *tx)
            .await?
            .try_get("table_exists")?;
        if !exists {
            bail!(
                ErrorKind::SetupFailed,
                "Table does not exist",
                format!("Table '{table_name}' does not exist")
            );
        }

        let columns: Vec<String> = sqlx::query(
            r#"
            select attname::text as column_name
            from pg_attribute
            where attrelid = $1::regclass and attnum > 0 and not attisdropped
            order by attnum
            "#,
        )
        .bind(&relation)
        .fetch_all(&mut *tx)
        .await?
        .iter()
        .map(|row| row.try_get("column_name"))
        .collect::<Result<_, _>>()?;

        let candidates = fetch_key_candidates(&mut tx, &relation).await?;
        let key_columns = choose_capture_key(table_name, &candidates)?;
        let tracked_columns =
            resolve_tracked_columns(table_name, &columns, &key_columns, tracked_columns)?;

        for statement in [
            drop_trigger_statement(table_name),
            create_trigger_statement(table_name, &tracked_columns),
        ] {
            sqlx::query(&statement)
                .execute(&mut *tx)
                .await
                .map_err(|err| {
                    cdc_error!(
                        ErrorKind::SetupFailed,
                        "Failed to install capture trigger",
                        format!("Could not install the capture trigger on table '{table_name}'"),
                        source: err
                    )
                })?;
        }

        sqlx::query(
            r#"
            insert into cdc.captured_tables (table_name, key_columns, tracked_columns)
            values ($1, $2, $3)
            "#,
        )
        .bind(table_name)
        .bind(sqlx::types::Json(&key_columns))
        .bind(sqlx::types::Json(&tracked_columns))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(table_name, ?key_columns, "installed postgres capture trigger");

        Ok(CaptureHandle {
            table_name: table_name.to_string(),
            key_columns,
            tracked_columns,
        })
    }

    async fn remove_capture(&self, table_name: &str) -> CdcResult<bool> {
        let mut tx = self.pool().begin().await?;

        let result = sqlx::query("delete from cdc.captured_tables where table_name = $1")
            .bind(table_name)
            .execute(&mut *tx)
            .await?;

        let exists: bool = sqlx::query("select to_regclass($1) is not null as table_exists")
            .bind(quote_table_name(table_name))
            .fetch_one(&mut *tx)
            .await?
            .try_get("table_exists")?;
        if exists {
            sqlx::query(&drop_trigger_statement(table_name))
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        let removed = result.rows_affected() > 0;
        if removed {
            info!(table_name, "removed postgres capture trigger");
        }

        Ok(removed)
    }

    async fn captured_tables(&self) -> CdcResult<Vec<CaptureHandle>> {
        let rows = sqlx::query(
            "select table_name, key_columns, tracked_columns from cdc.captured_tables order by table_name",
        )
        .fetch_all(self.pool())
        .await?;

        rows.iter().map(decode_handle).collect()
    }
}

async fn fetch_handle(
    connection: &mut PgConnection,
    table_name: &str,
) -> CdcResult<Option<CaptureHandle>> {
    let row = sqlx::query(
        "select table_name, key_columns, tracked_columns from cdc.captured_tables where table_name = $1",
    )
    .bind(table_name)
    .fetch_optional(&mut *connection)
    .await?;

    row.as_ref().map(decode_handle).transpose()
}

fn decode_handle(row: &sqlx::postgres::PgRow) -> CdcResult<CaptureHandle> {
    let key_columns: sqlx::types::Json<Vec<String>> = row.try_get("key_columns")?;
    let tracked_columns: sqlx::types::Json<Vec<String>> = row.try_get("tracked_columns")?;

    Ok(CaptureHandle {
        table_name: row.try_get("table_name")?,
        key_columns: key_columns.0,
        tracked_columns: tracked_columns.0,
    })
}

/// Lists the primary key and the unique indexes of a relation, primary key first.
///
/// Partial and expression indexes cannot key a row and are skipped.
async fn fetch_key_candidates(
    connection: &mut PgConnection,
    relation: &str,
) -> CdcResult<Vec<KeyCandidate>> {
    let rows = sqlx::query(
        r#"
        select i.indisprimary as is_primary,
               array_agg(a.attname::text order by array_position(i.indkey::int2[], a.attnum))
                   as key_columns,
               bool_and(a.attnotnull) as all_not_null
        from pg_index i
        join pg_attribute a on a.attrelid = i.indrelid and a.attnum = any(i.indkey::int2[])
        where i.indrelid = $1::regclass
          and i.indisunique
          and i.indpred is null
          and i.indexprs is null
        group by i.indexrelid, i.indisprimary
        order by i.indisprimary desc, i.indexrelid
        "#,
    )
    .bind(relation)
    .fetch_all(&mut *connection)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(KeyCandidate {
                is_primary: row.try_get("is_primary")?,
                columns: row.try_get("key_columns")?,
                all_not_null: row.try_get("all_not_null")?,
            })
        })
        .collect()
}

/// Quotes a possibly schema-qualified table name.
pub(crate) fn quote_table_name(table_name: &str) -> String {
    match table_name.split_once('.') {
        Some((schema, table)) => format!("{}.{}", quote_identifier(schema), quote_identifier(table)),
        None => quote_identifier(table_name).to_string(),
    }
}

/// Derives a valid trigger name from the table name.
fn trigger_name(table_name: &str) -> String {
    let mut name: String = format!("cdc_capture_{table_name}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    name.truncate(MAX_IDENTIFIER_LENGTH);

    name
}

fn drop_trigger_statement(table_name: &str) -> String {
    format!(
        "drop trigger if exists {} on {}",
        quote_identifier(&trigger_name(table_name)),
        quote_table_name(table_name)
    )
}

fn create_trigger_statement(table_name: &str, tracked_columns: &[String]) -> String {
    let arguments = std::iter::once(table_name)
        .chain(tracked_columns.iter().map(String::as_str))
        .map(|argument| quote_literal(argument).to_string())
        .collect::<Vec<_>>()
        .join(", ");

    format!(
        "create trigger {} after insert or update or delete on {} for each row execute function cdc.capture_change({})",
        quote_identifier(&trigger_name(table_name)),
        quote_table_name(table_name),
        arguments
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_name_is_a_plain_identifier() {
        assert_eq!(trigger_name("public.Users"), "cdc_capture_public_Users");
        assert_eq!(trigger_name(&"t".repeat(100)).len(), MAX_IDENTIFIER_LENGTH);
    }

    #[test]
    fn schema_qualified_names_are_quoted_per_part() {
        assert_eq!(quote_table_name("public.users"), "public.users");
        assert_eq!(quote_table_name("Users"), "\"Users\"");
    }

    #[test]
    fn trigger_passes_table_and_tracked_columns() {
        let statement =
            create_trigger_statement("users", &["id".to_string(), "name".to_string()]);

        assert!(statement.ends_with("execute function cdc.capture_change('users', 'id', 'name')"));
    }
}
