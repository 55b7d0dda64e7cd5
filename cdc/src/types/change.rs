use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::bail;
use crate::error::{CdcError, CdcResult, ErrorKind};
use crate::types::RowImage;

/// Identifier of a change record. Strictly increasing in append order.
pub type ChangeId = i64;

/// Kind of mutation captured by a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Insert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INSERT" => Ok(Operation::Insert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown change operation",
                format!("Operation '{other}' is not one of INSERT, UPDATE, DELETE")
            ),
        }
    }
}

/// The captured mutation together with its row images.
///
/// Inserts carry only the after image and deletes only the before image, so a change without any
/// image cannot be represented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "operation", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RowChange {
    Insert { after: RowImage },
    Update { before: RowImage, after: RowImage },
    Delete { before: RowImage },
}

impl RowChange {
    /// Rebuilds a change from its persisted operation and images.
    pub fn from_images(
        operation: Operation,
        before: Option<RowImage>,
        after: Option<RowImage>,
    ) -> CdcResult<RowChange> {
        match (operation, before, after) {
            (Operation::Insert, None, Some(after)) => Ok(RowChange::Insert { after }),
            (Operation::Update, Some(before), Some(after)) => {
                Ok(RowChange::Update { before, after })
            }
            (Operation::Delete, Some(before), None) => Ok(RowChange::Delete { before }),
            (operation, before, after) => bail!(
                ErrorKind::InvalidData,
                "Change images do not match the operation",
                format!(
                    "{operation} change has before image: {}, after image: {}",
                    before.is_some(),
                    after.is_some()
                )
            ),
        }
    }

    pub fn operation(&self) -> Operation {
        match self {
            RowChange::Insert { .. } => Operation::Insert,
            RowChange::Update { .. } => Operation::Update,
            RowChange::Delete { .. } => Operation::Delete,
        }
    }

    pub fn before_image(&self) -> Option<&RowImage> {
        match self {
            RowChange::Insert { .. } => None,
            RowChange::Update { before, .. } | RowChange::Delete { before } => Some(before),
        }
    }

    pub fn after_image(&self) -> Option<&RowImage> {
        match self {
            RowChange::Insert { after } | RowChange::Update { after, .. } => Some(after),
            RowChange::Delete { .. } => None,
        }
    }
}

/// Replication status of a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Captured and not yet applied.
    Pending,
    /// Failed at least once and still eligible for retry.
    Failed,
    /// Applied to the target. Terminal.
    Synced,
    /// Exhausted its retry budget. Terminal for the replication path.
    DeadLetter,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Failed => "failed",
            ChangeStatus::Synced => "synced",
            ChangeStatus::DeadLetter => "dead_letter",
        }
    }

    /// Returns whether records in this status are returned by pending reads.
    pub fn is_replicable(&self) -> bool {
        matches!(self, ChangeStatus::Pending | ChangeStatus::Failed)
    }
}

impl fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeStatus {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangeStatus::Pending),
            "failed" => Ok(ChangeStatus::Failed),
            "synced" => Ok(ChangeStatus::Synced),
            "dead_letter" => Ok(ChangeStatus::DeadLetter),
            other => bail!(
                ErrorKind::InvalidData,
                "Unknown change status",
                format!("Status '{other}' is not recognized")
            ),
        }
    }
}

/// A change about to be appended to the audit store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChange {
    pub table_name: String,
    pub change: RowChange,
}

impl NewChange {
    pub fn new(table_name: impl Into<String>, change: RowChange) -> Self {
        Self {
            table_name: table_name.into(),
            change,
        }
    }
}

/// A persisted change record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub id: ChangeId,
    pub table_name: String,
    pub change: RowChange,
    pub captured_at: DateTime<Utc>,
    pub status: ChangeStatus,
    pub attempt_count: u32,
    pub last_error: Option<String>,
    pub synced_at: Option<DateTime<Utc>>,
}

impl ChangeRecord {
    pub fn operation(&self) -> Operation {
        self.change.operation()
    }
}

/// Result of marking a record as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedChange {
    pub id: ChangeId,
    pub attempt_count: u32,
    pub status: ChangeStatus,
}

impl FailedChange {
    pub fn is_dead_letter(&self) -> bool {
        self.status == ChangeStatus::DeadLetter
    }
}

/// Status a record takes after its `attempt_count`-th failure.
pub(crate) fn status_after_failure(attempt_count: u32, max_attempts: u32) -> ChangeStatus {
    if attempt_count > max_attempts {
        ChangeStatus::DeadLetter
    } else {
        ChangeStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::types::row_image;

    #[test]
    fn mismatched_images_are_rejected() {
        let image = row_image([("id", json!(1))]);

        let err = RowChange::from_images(Operation::Insert, Some(image.clone()), Some(image))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);

        let err = RowChange::from_images(Operation::Delete, None, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn images_follow_operation() {
        let before = row_image([("id", json!(1)), ("name", json!("A"))]);
        let after = row_image([("id", json!(1)), ("name", json!("B"))]);

        let change =
            RowChange::from_images(Operation::Update, Some(before.clone()), Some(after.clone()))
                .unwrap();

        assert_eq!(change.operation(), Operation::Update);
        assert_eq!(change.before_image(), Some(&before));
        assert_eq!(change.after_image(), Some(&after));
    }

    #[test]
    fn dead_letter_once_attempts_exceed_ceiling() {
        assert_eq!(status_after_failure(3, 3), ChangeStatus::Failed);
        assert_eq!(status_after_failure(4, 3), ChangeStatus::DeadLetter);
    }

    #[test]
    fn statuses_round_trip_through_their_names() {
        for status in [
            ChangeStatus::Pending,
            ChangeStatus::Failed,
            ChangeStatus::Synced,
            ChangeStatus::DeadLetter,
        ] {
            assert_eq!(status.as_str().parse::<ChangeStatus>().unwrap(), status);
        }
    }
}
