use std::collections::{HashMap, HashSet};

use tokio::sync::OwnedMutexGuard;
use tracing::debug;

use crate::bail;
use crate::cdc_error;
use crate::clock::SharedClock;
use crate::error::{CdcResult, ErrorKind};
use crate::failpoints::{CAPTURE_BEFORE_APPEND, cdc_fail_point};
use crate::store::memory::{Inner, MemoryTable};
use crate::types::{ChangeId, NewChange, RowChange, RowImage, RowKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TransactionState {
    Active,
    /// A capture hook failed and every effect of the transaction was undone.
    Aborted,
    Finished,
}

/// Transaction over a [`super::MemoryDatabase`].
///
/// Statements apply immediately and fire the capture hooks of captured tables, which append to
/// the audit log under the same lock. Dropping the transaction without committing rolls it back.
#[derive(Debug)]
pub struct MemoryTransaction {
    guard: OwnedMutexGuard<Inner>,
    clock: SharedClock,
    /// Rows of every table touched so far, as they were before the transaction.
    original_rows: HashMap<String, Vec<RowImage>>,
    appended: Vec<ChangeId>,
    state: TransactionState,
}

impl MemoryTransaction {
    pub(crate) fn new(guard: OwnedMutexGuard<Inner>, clock: SharedClock) -> Self {
        Self {
            guard,
            clock,
            original_rows: HashMap::new(),
            appended: Vec::new(),
            state: TransactionState::Active,
        }
    }

    /// Inserts a row. Columns missing from `row` are stored as null.
    pub fn insert(&mut self, table_name: &str, mut row: RowImage) -> CdcResult<()> {
        self.ensure_active()?;

        let table = table_mut(&mut self.guard, table_name)?;
        check_columns(table_name, table, &row)?;
        for column in &table.columns {
            row.entry(column.clone()).or_insert(serde_json::Value::Null);
        }

        if !table.key_columns.is_empty() {
            let key = RowKey::from_image(&row, &table.key_columns)?;
            if find_by_key(table, &key).is_some() {
                bail!(
                    ErrorKind::InvalidData,
                    "Duplicate key value",
                    format!("Key {key} already exists in table '{table_name}'")
                );
            }
        }

        self.remember_table(table_name);
        let table = table_mut(&mut self.guard, table_name)?;
        table.rows.push(row.clone());

        self.capture(table_name, RowChange::Insert { after: row })
    }

    /// Applies `assignments` to every row whose columns equal the values in `filter`.
    ///
    /// Returns the number of updated rows.
    pub fn update(
        &mut self,
        table_name: &str,
        filter: &RowImage,
        assignments: RowImage,
    ) -> CdcResult<u64> {
        self.ensure_active()?;

        let table = table_mut(&mut self.guard, table_name)?;
        check_columns(table_name, table, filter)?;
        check_columns(table_name, table, &assignments)?;

        let matching = matching_rows(table, filter);
        let mut updates = Vec::with_capacity(matching.len());
        let mut new_keys = HashSet::new();
        for index in &matching {
            let before = table.rows[*index].clone();
            let mut after = before.clone();
            after.extend(assignments.clone());

            if !table.key_columns.is_empty() {
                let key = RowKey::from_image(&after, &table.key_columns)?;
                let conflict = find_by_key(table, &key).is_some_and(|other| other != *index);
                if conflict || !new_keys.insert(key.clone()) {
                    bail!(
                        ErrorKind::InvalidData,
                        "Duplicate key value",
                        format!("Key {key} already exists in table '{table_name}'")
                    );
                }
            }

            updates.push((*index, before, after));
        }

        self.remember_table(table_name);
        for (index, before, after) in updates.iter().cloned() {
            table_mut(&mut self.guard, table_name)?.rows[index] = after.clone();
            self.capture(table_name, RowChange::Update { before, after })?;
        }

        Ok(updates.len() as u64)
    }

    /// Deletes every row whose columns equal the values in `filter`.
    ///
    /// Returns the number of deleted rows.
    pub fn delete(&mut self, table_name: &str, filter: &RowImage) -> CdcResult<u64> {
        self.ensure_active()?;

        let table = table_mut(&mut self.guard, table_name)?;
        check_columns(table_name, table, filter)?;
        let matching = matching_rows(table, filter);

        self.remember_table(table_name);
        let table = table_mut(&mut self.guard, table_name)?;
        // Remove from the back so earlier indexes stay valid.
        let mut deleted = Vec::with_capacity(matching.len());
        for index in matching.iter().rev() {
            deleted.push(table.rows.remove(*index));
        }
        deleted.reverse();

        let count = deleted.len() as u64;
        for before in deleted {
            self.capture(table_name, RowChange::Delete { before })?;
        }

        Ok(count)
    }

    /// Commits the transaction.
    ///
    /// Fails when a capture hook aborted the transaction, in which case nothing was persisted.
    pub fn commit(mut self) -> CdcResult<()> {
        self.ensure_active()?;
        self.state = TransactionState::Finished;

        Ok(())
    }

    /// Rolls back every statement of the transaction, including the changes captured by them.
    pub fn rollback(mut self) {
        self.undo();
        self.state = TransactionState::Finished;
    }

    fn ensure_active(&self) -> CdcResult<()> {
        match self.state {
            TransactionState::Active => Ok(()),
            TransactionState::Aborted => bail!(
                ErrorKind::CaptureFailed,
                "Transaction was aborted by a failed capture hook"
            ),
            TransactionState::Finished => bail!(
                ErrorKind::InvalidData,
                "Transaction is already finished"
            ),
        }
    }

    fn remember_table(&mut self, table_name: &str) {
        if self.original_rows.contains_key(table_name) {
            return;
        }

        if let Some(table) = self.guard.tables.get(table_name) {
            self.original_rows
                .insert(table_name.to_string(), table.rows.clone());
        }
    }

    /// Runs the capture hook of `table_name`, if the table is captured.
    ///
    /// A failing hook undoes the whole transaction and the error is returned to the caller of the
    /// mutating statement.
    fn capture(&mut self, table_name: &str, change: RowChange) -> CdcResult<()> {
        let Some(handle) = self.guard.captures.get(table_name) else {
            return Ok(());
        };
        let change = project_change(change, &handle.tracked_columns);

        if let Err(err) = cdc_fail_point(CAPTURE_BEFORE_APPEND) {
            self.undo();
            self.state = TransactionState::Aborted;

            return Err(cdc_error!(
                ErrorKind::CaptureFailed,
                "Capture hook failed to append the change",
                format!("Mutation of table '{table_name}' was rolled back"),
                source: err
            ));
        }

        let id = self
            .guard
            .append(NewChange::new(table_name, change), self.clock.now());
        self.appended.push(id);

        Ok(())
    }

    fn undo(&mut self) {
        for (table_name, rows) in self.original_rows.drain() {
            if let Some(table) = self.guard.tables.get_mut(&table_name) {
                table.rows = rows;
            }
        }

        for id in self.appended.drain(..) {
            self.guard.remove_change(id);
        }
    }
}

impl Drop for MemoryTransaction {
    fn drop(&mut self) {
        if self.state == TransactionState::Active {
            debug!("rolling back memory transaction dropped without commit");
            self.undo();
        }
    }
}

fn table_mut<'a>(inner: &'a mut Inner, table_name: &str) -> CdcResult<&'a mut MemoryTable> {
    match inner.tables.get_mut(table_name) {
        Some(table) => Ok(table),
        None => bail!(
            ErrorKind::InvalidData,
            "Table does not exist",
            format!("Table '{table_name}' does not exist")
        ),
    }
}

fn check_columns(table_name: &str, table: &MemoryTable, row: &RowImage) -> CdcResult<()> {
    if let Some(column) = row.keys().find(|column| !table.columns.contains(column)) {
        bail!(
            ErrorKind::InvalidData,
            "Unknown column",
            format!("Column '{column}' does not exist in table '{table_name}'")
        );
    }

    Ok(())
}

fn matching_rows(table: &MemoryTable, filter: &RowImage) -> Vec<usize> {
    table
        .rows
        .iter()
        .enumerate()
        .filter(|(_, row)| {
            filter
                .iter()
                .all(|(column, value)| row.get(column) == Some(value))
        })
        .map(|(index, _)| index)
        .collect()
}

fn find_by_key(table: &MemoryTable, key: &RowKey) -> Option<usize> {
    table.rows.iter().position(|row| {
        RowKey::from_image(row, &table.key_columns).is_ok_and(|row_key| row_key == *key)
    })
}

fn project(image: RowImage, columns: &[String]) -> RowImage {
    image
        .into_iter()
        .filter(|(column, _)| columns.contains(column))
        .collect()
}

fn project_change(change: RowChange, columns: &[String]) -> RowChange {
    match change {
        RowChange::Insert { after } => RowChange::Insert {
            after: project(after, columns),
        },
        RowChange::Update { before, after } => RowChange::Update {
            before: project(before, columns),
            after: project(after, columns),
        },
        RowChange::Delete { before } => RowChange::Delete {
            before: project(before, columns),
        },
    }
}
