use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::CdcError;
use crate::types::ChangeId;

/// Number of batch outcomes kept for the monitor.
const MAX_RECORDED_OUTCOMES: usize = 1024;

/// Result of one replication pass over a table.
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// No pending records.
    Idle,
    /// Another replicator holds the apply-lease of the table.
    LeaseUnavailable,
    /// Every record of the batch was applied and marked as synced.
    Synced { count: u64 },
    /// A record failed to apply. The batch was rolled back and only that record was marked.
    RecordFailed {
        change_id: ChangeId,
        attempt_count: u32,
        dead_lettered: bool,
    },
    /// A systemic failure rolled the batch back without touching any record status.
    Aborted { error: CdcError },
    /// The batch was committed on the target but the lease expired before it could be marked.
    ///
    /// The records stay pending and are applied again by the next holder.
    LeaseLost { applied: u64 },
}

impl BatchOutcome {
    /// Returns whether the pass made progress without any failure.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            BatchOutcome::Idle | BatchOutcome::LeaseUnavailable | BatchOutcome::Synced { .. }
        )
    }

    /// Number of records that transitioned to synced.
    pub fn synced_count(&self) -> u64 {
        match self {
            BatchOutcome::Synced { count } => *count,
            _ => 0,
        }
    }
}

/// Summary of a finished pass, as kept by the [`OutcomeLog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedOutcome {
    pub table_name: String,
    pub finished_at: DateTime<Utc>,
    /// Records marked as synced by the pass.
    pub synced: u64,
    /// Failures of the pass: the failed record, or the whole pass when it aborted.
    pub failed: u64,
}

/// Bounded log of recent batch outcomes, shared by the replicator and the monitor.
#[derive(Debug, Clone, Default)]
pub struct OutcomeLog {
    outcomes: Arc<Mutex<VecDeque<RecordedOutcome>>>,
}

impl OutcomeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a pass. Idle and lease-unavailable passes did no work and are not recorded.
    pub async fn record(
        &self,
        table_name: &str,
        finished_at: DateTime<Utc>,
        outcome: &BatchOutcome,
    ) {
        let (synced, failed) = match outcome {
            BatchOutcome::Idle | BatchOutcome::LeaseUnavailable => return,
            BatchOutcome::Synced { count } => (*count, 0),
            BatchOutcome::LeaseLost { .. } => (0, 0),
            BatchOutcome::RecordFailed { .. } | BatchOutcome::Aborted { .. } => (0, 1),
        };

        self.push(RecordedOutcome {
            table_name: table_name.to_string(),
            finished_at,
            synced,
            failed,
        })
        .await;
    }

    /// Records a pass that failed before producing an outcome.
    pub async fn record_error(&self, table_name: &str, finished_at: DateTime<Utc>) {
        self.push(RecordedOutcome {
            table_name: table_name.to_string(),
            finished_at,
            synced: 0,
            failed: 1,
        })
        .await;
    }

    /// Returns the outcomes of passes that finished at or after `since`, oldest first.
    pub async fn recorded_since(&self, since: DateTime<Utc>) -> Vec<RecordedOutcome> {
        let outcomes = self.outcomes.lock().await;

        outcomes
            .iter()
            .filter(|outcome| outcome.finished_at >= since)
            .cloned()
            .collect()
    }

    async fn push(&self, outcome: RecordedOutcome) {
        let mut outcomes = self.outcomes.lock().await;
        if outcomes.len() == MAX_RECORDED_OUTCOMES {
            outcomes.pop_front();
        }
        outcomes.push_back(outcome);
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::error::ErrorKind;

    #[tokio::test]
    async fn idle_passes_are_not_recorded() {
        let log = OutcomeLog::new();
        let now = Utc::now();
        log.record("users", now, &BatchOutcome::Idle).await;
        log.record("users", now, &BatchOutcome::LeaseUnavailable).await;

        assert!(log.recorded_since(now).await.is_empty());
    }

    #[tokio::test]
    async fn filters_by_finish_time() {
        let log = OutcomeLog::new();
        let now = Utc::now();
        log.record(
            "users",
            now - TimeDelta::minutes(5),
            &BatchOutcome::Synced { count: 10 },
        )
        .await;
        log.record(
            "users",
            now,
            &BatchOutcome::Aborted {
                error: CdcError::from((ErrorKind::TargetConnectionFailed, "down")),
            },
        )
        .await;

        let recent = log.recorded_since(now - TimeDelta::minutes(1)).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].failed, 1);
    }

    #[tokio::test]
    async fn keeps_a_bounded_history() {
        let log = OutcomeLog::new();
        let start = Utc::now();
        for i in 0..(MAX_RECORDED_OUTCOMES + 10) {
            log.record(
                "users",
                start + TimeDelta::seconds(i as i64),
                &BatchOutcome::Synced { count: 1 },
            )
            .await;
        }

        let all = log.recorded_since(start).await;
        assert_eq!(all.len(), MAX_RECORDED_OUTCOMES);
        assert_eq!(all[0].finished_at, start + TimeDelta::seconds(10));
    }
}
