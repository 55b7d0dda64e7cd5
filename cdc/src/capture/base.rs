use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{CdcResult, ErrorKind};

/// Description of the capture installed on a table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureHandle {
    pub table_name: String,
    /// Columns of the primary or unique key the target writes are keyed on.
    pub key_columns: Vec<String>,
    /// Columns recorded in the change images, always including the key columns.
    pub tracked_columns: Vec<String>,
}

/// Installs hooks that record every mutation of a table in the audit store.
///
/// The hooks run synchronously inside the mutating transaction: if appending the change fails,
/// the mutation fails with it.
pub trait CaptureInstaller {
    /// Installs insert, update and delete hooks on `table_name`.
    ///
    /// `tracked_columns` selects the columns recorded in change images; an empty slice tracks
    /// every column. Fails with [`ErrorKind::SetupFailed`] when the table does not exist, has no
    /// primary or non-nullable unique key, or a tracked column does not exist. Installing on a
    /// table that is already captured returns the existing handle and changes nothing.
    fn setup_capture(
        &self,
        table_name: &str,
        tracked_columns: &[&str],
    ) -> impl Future<Output = CdcResult<CaptureHandle>> + Send;

    /// Removes the hooks of `table_name`. Already captured changes are kept.
    ///
    /// Returns whether the table was captured.
    fn remove_capture(&self, table_name: &str) -> impl Future<Output = CdcResult<bool>> + Send;

    /// Returns the handles of every captured table.
    fn captured_tables(&self) -> impl Future<Output = CdcResult<Vec<CaptureHandle>>> + Send;
}

/// A unique index of a table, candidate for keying captured rows.
#[derive(Debug, Clone)]
pub(crate) struct KeyCandidate {
    pub(crate) is_primary: bool,
    pub(crate) columns: Vec<String>,
    pub(crate) all_not_null: bool,
}

/// Picks the key used for captured rows: the primary key, else the first unique key whose
/// columns are all non-nullable.
pub(crate) fn choose_capture_key(
    table_name: &str,
    candidates: &[KeyCandidate],
) -> CdcResult<Vec<String>> {
    let primary = candidates
        .iter()
        .find(|candidate| {
            candidate.is_primary && candidate.all_not_null && !candidate.columns.is_empty()
        });
    let unique = candidates.iter().find(|candidate| {
        !candidate.is_primary && candidate.all_not_null && !candidate.columns.is_empty()
    });

    match primary.or(unique) {
        Some(candidate) => Ok(candidate.columns.clone()),
        None => bail!(
            ErrorKind::SetupFailed,
            "Table has no stable key",
            format!(
                "Table '{table_name}' needs a primary key or a unique key on non-nullable columns"
            )
        ),
    }
}

/// Resolves the columns recorded in change images.
///
/// Every requested column must exist. Key columns are always included and the result follows the
/// table's column order.
pub(crate) fn resolve_tracked_columns(
    table_name: &str,
    table_columns: &[String],
    key_columns: &[String],
    requested: &[&str],
) -> CdcResult<Vec<String>> {
    if let Some(column) = requested
        .iter()
        .find(|column| !table_columns.iter().any(|existing| existing == *column))
    {
        bail!(
            ErrorKind::SetupFailed,
            "Tracked column does not exist",
            format!("Column '{column}' does not exist in table '{table_name}'")
        );
    }

    Ok(table_columns
        .iter()
        .filter(|column| {
            requested.is_empty()
                || key_columns.contains(column)
                || requested.contains(&column.as_str())
        })
        .cloned()
        .collect())
}

/// Rejects table names that cannot be captured.
pub(crate) fn validate_table_name(table_name: &str) -> CdcResult<()> {
    if table_name.trim().is_empty() || table_name.contains('\0') {
        bail!(
            ErrorKind::SetupFailed,
            "Invalid table name",
            format!("'{table_name}' is not a valid table name")
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn primary_key_wins_over_unique_key() {
        let candidates = vec![
            KeyCandidate {
                is_primary: false,
                columns: columns(&["email"]),
                all_not_null: true,
            },
            KeyCandidate {
                is_primary: true,
                columns: columns(&["id"]),
                all_not_null: true,
            },
        ];

        assert_eq!(
            choose_capture_key("users", &candidates).unwrap(),
            columns(&["id"])
        );
    }

    #[test]
    fn nullable_unique_key_is_not_stable() {
        let candidates = vec![KeyCandidate {
            is_primary: false,
            columns: columns(&["email"]),
            all_not_null: false,
        }];

        let err = choose_capture_key("users", &candidates).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SetupFailed);
    }

    #[test]
    fn nullable_primary_key_falls_back_to_unique_key() {
        let candidates = vec![
            KeyCandidate {
                is_primary: true,
                columns: columns(&["code"]),
                all_not_null: false,
            },
            KeyCandidate {
                is_primary: false,
                columns: columns(&["slug"]),
                all_not_null: true,
            },
        ];

        assert_eq!(
            choose_capture_key("codes", &candidates).unwrap(),
            columns(&["slug"])
        );

        let err = choose_capture_key("codes", &candidates[..1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SetupFailed);
    }

    #[test]
    fn tracked_columns_always_include_key() {
        let tracked = resolve_tracked_columns(
            "users",
            &columns(&["id", "name", "email"]),
            &columns(&["id"]),
            &["email"],
        )
        .unwrap();

        assert_eq!(tracked, columns(&["id", "email"]));
    }

    #[test]
    fn unknown_tracked_column_fails_setup() {
        let err = resolve_tracked_columns("users", &columns(&["id"]), &columns(&["id"]), &["age"])
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::SetupFailed);
    }
}
