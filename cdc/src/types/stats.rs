use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

use crate::types::{ChangeStatus, Operation};

/// Per-operation record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OperationCounts {
    /// Records still waiting to be applied, including failed but retryable ones.
    pub pending: u64,
    pub synced: u64,
    pub dead_letter: u64,
}

/// Aggregated audit state of one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TableStatistics {
    pub table_name: String,
    /// Records returned by pending reads: pending plus failed but retryable.
    pub pending_count: u64,
    /// Subset of `pending_count` that failed at least once.
    pub failed_count: u64,
    pub synced_count: u64,
    pub dead_letter_count: u64,
    /// Age of the oldest replicable record.
    pub oldest_pending_age: Option<Duration>,
    pub by_operation: BTreeMap<Operation, OperationCounts>,
}

impl TableStatistics {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            ..Self::default()
        }
    }

    /// Adds `count` records of the given operation and status.
    pub(crate) fn add(&mut self, operation: Operation, status: ChangeStatus, count: u64) {
        let counts = self.by_operation.entry(operation).or_default();
        match status {
            ChangeStatus::Pending => {
                self.pending_count += count;
                counts.pending += count;
            }
            ChangeStatus::Failed => {
                self.pending_count += count;
                self.failed_count += count;
                counts.pending += count;
            }
            ChangeStatus::Synced => {
                self.synced_count += count;
                counts.synced += count;
            }
            ChangeStatus::DeadLetter => {
                self.dead_letter_count += count;
                counts.dead_letter += count;
            }
        }
    }

    /// Keeps the oldest of the current and the given pending age.
    pub(crate) fn observe_pending_age(&mut self, age: Duration) {
        self.oldest_pending_age = Some(match self.oldest_pending_age {
            Some(current) => current.max(age),
            None => age,
        });
    }

    pub fn total_count(&self) -> u64 {
        self.pending_count + self.synced_count + self.dead_letter_count
    }
}
