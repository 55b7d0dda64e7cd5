//! Core data types shared by capture, storage and replication.

mod change;
mod row;
mod stats;

pub use change::{
    ChangeId, ChangeRecord, ChangeStatus, FailedChange, NewChange, Operation, RowChange,
};
pub use row::{RowImage, RowKey, row_image};
pub use stats::{OperationCounts, TableStatistics};

pub(crate) use change::status_after_failure;
