use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

use crate::destination::{Destination, DestinationTransaction};
use crate::error::CdcResult;
use crate::types::{RowImage, RowKey};

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<RowKey, RowImage>>,
}

#[derive(Debug)]
enum StagedWrite {
    Upsert {
        table: String,
        key: RowKey,
        row: RowImage,
    },
    Delete {
        table: String,
        key: RowKey,
    },
}

/// In-memory destination for tests and local runs.
///
/// Rows are kept per target table and keyed by their key columns. Writes are staged in the
/// transaction and applied together on commit.
#[derive(Debug, Clone, Default)]
pub struct MemoryDestination {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the rows of `target_table` in key order.
    pub async fn rows(&self, target_table: &str) -> Vec<RowImage> {
        let inner = self.inner.lock().await;

        inner
            .tables
            .get(target_table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the row of `target_table` whose key columns match `key`.
    pub async fn get_row(
        &self,
        target_table: &str,
        key_columns: &[String],
        key: &RowImage,
    ) -> CdcResult<Option<RowImage>> {
        let key = RowKey::from_image(key, key_columns)?;
        let inner = self.inner.lock().await;

        Ok(inner
            .tables
            .get(target_table)
            .and_then(|rows| rows.get(&key))
            .cloned())
    }
}

impl Destination for MemoryDestination {
    type Transaction = MemoryDestinationTransaction;

    fn name() -> &'static str {
        "memory"
    }

    async fn begin(&self) -> CdcResult<Self::Transaction> {
        Ok(MemoryDestinationTransaction {
            inner: self.inner.clone(),
            staged: Vec::new(),
        })
    }
}

/// Transaction of a [`MemoryDestination`]. Dropping it without committing discards its writes.
#[derive(Debug)]
pub struct MemoryDestinationTransaction {
    inner: Arc<Mutex<Inner>>,
    staged: Vec<StagedWrite>,
}

impl DestinationTransaction for MemoryDestinationTransaction {
    async fn upsert(
        &mut self,
        target_table: &str,
        key_columns: &[String],
        row: &RowImage,
    ) -> CdcResult<()> {
        self.staged.push(StagedWrite::Upsert {
            table: target_table.to_string(),
            key: RowKey::from_image(row, key_columns)?,
            row: row.clone(),
        });

        Ok(())
    }

    async fn delete(
        &mut self,
        target_table: &str,
        key_columns: &[String],
        key: &RowImage,
    ) -> CdcResult<()> {
        self.staged.push(StagedWrite::Delete {
            table: target_table.to_string(),
            key: RowKey::from_image(key, key_columns)?,
        });

        Ok(())
    }

    async fn commit(self) -> CdcResult<()> {
        let mut inner = self.inner.lock().await;
        let writes = self.staged.len();

        for write in self.staged {
            match write {
                StagedWrite::Upsert { table, key, row } => {
                    inner
                        .tables
                        .entry(table)
                        .or_default()
                        .entry(key)
                        .or_default()
                        .extend(row);
                }
                StagedWrite::Delete { table, key } => {
                    if let Some(rows) = inner.tables.get_mut(&table) {
                        rows.remove(&key);
                    }
                }
            }
        }

        debug!(writes, "committed memory destination transaction");

        Ok(())
    }

    async fn rollback(self) -> CdcResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::row_image;

    fn id_key() -> Vec<String> {
        vec!["id".to_string()]
    }

    #[tokio::test]
    async fn writes_become_visible_only_on_commit() {
        let destination = MemoryDestination::new();
        let mut tx = destination.begin().await.unwrap();
        tx.upsert("users", &id_key(), &row_image([("id", json!(1)), ("name", json!("Ana"))]))
            .await
            .unwrap();

        assert!(destination.rows("users").await.is_empty());

        tx.commit().await.unwrap();
        assert_eq!(destination.rows("users").await.len(), 1);
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let destination = MemoryDestination::new();
        let mut tx = destination.begin().await.unwrap();
        tx.upsert("users", &id_key(), &row_image([("id", json!(1))]))
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert!(destination.rows("users").await.is_empty());
    }

    #[tokio::test]
    async fn upsert_overwrites_and_delete_is_idempotent() {
        let destination = MemoryDestination::new();
        let key = row_image([("id", json!(1))]);

        let mut tx = destination.begin().await.unwrap();
        tx.upsert("users", &id_key(), &row_image([("id", json!(1)), ("name", json!("Ana"))]))
            .await
            .unwrap();
        tx.upsert("users", &id_key(), &row_image([("id", json!(1)), ("name", json!("Bea"))]))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let row = destination.get_row("users", &id_key(), &key).await.unwrap();
        assert_eq!(row.unwrap()["name"], json!("Bea"));

        for _ in 0..2 {
            let mut tx = destination.begin().await.unwrap();
            tx.delete("users", &id_key(), &key).await.unwrap();
            tx.commit().await.unwrap();
        }
        assert!(destination.rows("users").await.is_empty());
    }
}
