//! Health reporting over the audit store and recent replication outcomes.
//!
//! The monitor keeps no state of its own: every report is derived from the store statistics
//! and the [`OutcomeLog`] shared with the replicator.

use std::fmt;
use std::time::Duration;

use cdc_config::shared::MonitorConfig;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::clock::SharedClock;
use crate::error::CdcResult;
use crate::replication::{CdcContext, OutcomeLog};
use crate::store::AuditStore;

/// Overall health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    /// The backlog crossed the warning threshold or recent passes failed.
    Warning,
    /// At least one record was dead-lettered and needs an operator.
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health of a single table.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TableHealth {
    pub table_name: String,
    pub lag_seconds: f64,
    pub pending_backlog: u64,
    pub failed_count: u64,
    pub synced_count: u64,
    pub dead_letter_count: u64,
    pub synced_in_interval: u64,
    /// Passes of the last interval that failed.
    pub failures_in_interval: u64,
}

/// Point-in-time health of the whole system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub generated_at: DateTime<Utc>,
    pub status: HealthStatus,
    /// Age of the oldest replicable record across every table.
    pub lag_seconds: f64,
    pub pending_backlog: u64,
    pub dead_letter_count: u64,
    /// Failed passes divided by all recorded passes of the last interval, between 0 and 1.
    ///
    /// Counted per pass, not per record, so a large successful batch weighs as much as a failed
    /// one.
    pub error_rate: f64,
    /// Records synced during the last interval.
    pub throughput_per_interval: u64,
    pub interval_secs: u64,
    pub tables: Vec<TableHealth>,
}

impl fmt::Display for HealthReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "CDC health report at {}", self.generated_at.to_rfc3339())?;
        writeln!(f, "status: {}", self.status)?;
        writeln!(f, "lag: {:.1}s", self.lag_seconds)?;
        writeln!(f, "pending backlog: {}", self.pending_backlog)?;
        writeln!(f, "dead letters: {}", self.dead_letter_count)?;
        writeln!(
            f,
            "last {}s: {} synced, error rate {:.2}",
            self.interval_secs, self.throughput_per_interval, self.error_rate
        )?;
        for table in &self.tables {
            writeln!(
                f,
                "  {}: {} pending ({} failed), {} synced, {} dead letters, lag {:.1}s",
                table.table_name,
                table.pending_backlog,
                table.failed_count,
                table.synced_count,
                table.dead_letter_count,
                table.lag_seconds
            )?;
        }

        Ok(())
    }
}

/// Read-only view deriving [`HealthReport`]s.
#[derive(Debug, Clone)]
pub struct Monitor<S> {
    store: S,
    outcomes: OutcomeLog,
    clock: SharedClock,
    config: MonitorConfig,
}

impl<S> Monitor<S>
where
    S: AuditStore,
{
    pub fn new(store: S, outcomes: OutcomeLog, clock: SharedClock, config: MonitorConfig) -> Self {
        Self {
            store,
            outcomes,
            clock,
            config,
        }
    }

    /// Builds a monitor observing the store and outcome log of a replication context.
    pub fn from_context<D>(context: &CdcContext<S, D>, config: MonitorConfig) -> Self
    where
        S: Clone,
    {
        Self::new(
            context.store.clone(),
            context.outcomes.clone(),
            context.clock.clone(),
            config,
        )
    }

    pub async fn get_health_report(&self) -> CdcResult<HealthReport> {
        let now = self.clock.now();
        let statistics = self.store.get_all_statistics().await?;

        let window = chrono::Duration::from_std(self.config.interval())
            .unwrap_or(chrono::Duration::MAX);
        let since = now
            .checked_sub_signed(window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let recent = self.outcomes.recorded_since(since).await;

        let tables: Vec<TableHealth> = statistics
            .iter()
            .map(|stats| {
                let (synced_in_interval, failures_in_interval) = recent
                    .iter()
                    .filter(|outcome| outcome.table_name == stats.table_name)
                    .fold((0, 0), |(synced, failed), outcome| {
                        (synced + outcome.synced, failed + outcome.failed)
                    });

                TableHealth {
                    table_name: stats.table_name.clone(),
                    lag_seconds: stats
                        .oldest_pending_age
                        .unwrap_or(Duration::ZERO)
                        .as_secs_f64(),
                    pending_backlog: stats.pending_count,
                    failed_count: stats.failed_count,
                    synced_count: stats.synced_count,
                    dead_letter_count: stats.dead_letter_count,
                    synced_in_interval,
                    failures_in_interval,
                }
            })
            .collect();

        let lag_seconds = tables
            .iter()
            .map(|table| table.lag_seconds)
            .fold(0.0, f64::max);
        let pending_backlog = tables.iter().map(|table| table.pending_backlog).sum();
        let dead_letter_count = tables.iter().map(|table| table.dead_letter_count).sum();
        let throughput_per_interval: u64 = recent.iter().map(|outcome| outcome.synced).sum();
        let failed_passes = recent.iter().filter(|outcome| outcome.failed > 0).count();
        let error_rate = match recent.len() {
            0 => 0.0,
            passes => failed_passes as f64 / passes as f64,
        };

        let status = self.classify(pending_backlog, dead_letter_count, error_rate);

        Ok(HealthReport {
            generated_at: now,
            status,
            lag_seconds,
            pending_backlog,
            dead_letter_count,
            error_rate,
            throughput_per_interval,
            interval_secs: self.config.interval_secs,
            tables,
        })
    }

    fn classify(&self, pending_backlog: u64, dead_letter_count: u64, error_rate: f64) -> HealthStatus {
        if dead_letter_count > 0 {
            HealthStatus::Critical
        } else if pending_backlog >= self.config.backlog_warning_threshold || error_rate > 0.0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        }
    }
}
