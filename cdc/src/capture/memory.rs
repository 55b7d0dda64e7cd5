use tracing::info;

use crate::bail;
use crate::capture::base::{
    CaptureHandle, CaptureInstaller, KeyCandidate, choose_capture_key, resolve_tracked_columns,
    validate_table_name,
};
use crate::error::{CdcResult, ErrorKind};
use crate::store::memory::MemoryDatabase;

impl CaptureInstaller for MemoryDatabase {
    async fn setup_capture(
        &self,
        table_name: &str,
        tracked_columns: &[&str],
    ) -> CdcResult<CaptureHandle> {
        validate_table_name(table_name)?;
        let mut inner = self.lock().await;

        if let Some(handle) = inner.captures.get(table_name) {
            return Ok(handle.clone());
        }

        let Some(table) = inner.tables.get(table_name) else {
            bail!(
                ErrorKind::SetupFailed,
                "Table does not exist",
                format!("Table '{table_name}' does not exist")
            );
        };

        let candidates = [KeyCandidate {
            is_primary: true,
            columns: table.key_columns.clone(),
            all_not_null: true,
        }];
        let key_columns = choose_capture_key(table_name, &candidates)?;
        let tracked_columns =
            resolve_tracked_columns(table_name, &table.columns, &key_columns, tracked_columns)?;

        let handle = CaptureHandle {
            table_name: table_name.to_string(),
            key_columns,
            tracked_columns,
        };
        inner
            .captures
            .insert(table_name.to_string(), handle.clone());

        info!(table_name, "installed memory capture hooks");

        Ok(handle)
    }

    async fn remove_capture(&self, table_name: &str) -> CdcResult<bool> {
        let mut inner = self.lock().await;

        Ok(inner.captures.remove(table_name).is_some())
    }

    async fn captured_tables(&self) -> CdcResult<Vec<CaptureHandle>> {
        let inner = self.lock().await;

        Ok(inner.captures.values().cloned().collect())
    }
}
