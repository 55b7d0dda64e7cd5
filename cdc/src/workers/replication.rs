use std::sync::Arc;

use cdc_config::shared::ReplicationConfig;
use tokio::task::JoinHandle;
use tracing::{Instrument, error, info};

use crate::cdc_error;
use crate::concurrency::shutdown::{ShutdownRx, is_shutdown_requested};
use crate::destination::Destination;
use crate::error::{CdcResult, ErrorKind};
use crate::replication::backoff::Backoff;
use crate::replication::{BatchOutcome, Replicator};
use crate::store::{AuditStore, LeaseStore};

/// Handle of a spawned [`ReplicationWorker`].
#[derive(Debug)]
pub struct ReplicationWorkerHandle {
    table_name: String,
    handle: Option<JoinHandle<CdcResult<()>>>,
}

impl ReplicationWorkerHandle {
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Waits for the worker to stop, mapping a panic or cancellation of its task to an error.
    pub async fn wait(mut self) -> CdcResult<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        handle.await.map_err(|err| {
            if err.is_cancelled() {
                cdc_error!(
                    ErrorKind::ReplicationWorkerCancelled,
                    "Replication worker was cancelled",
                    format!("Worker of table '{}' was cancelled", self.table_name),
                    source: err
                )
            } else {
                cdc_error!(
                    ErrorKind::ReplicationWorkerPanic,
                    "Replication worker panicked",
                    format!("Worker of table '{}' panicked", self.table_name),
                    source: err
                )
            }
        })??;

        Ok(())
    }
}

/// Polling loop replicating one table until shutdown.
///
/// Each pass drains the table batch by batch while batches come back full, then sleeps for the
/// poll interval. After a failed pass the sleep follows an exponential backoff instead, reset by
/// the next successful pass. Shutdown is only observed between batches, so an in-flight batch is
/// always either committed and marked or fully rolled back.
#[derive(Debug)]
pub struct ReplicationWorker<S, D> {
    replicator: Arc<Replicator<S, D>>,
    table_name: String,
    config: Arc<ReplicationConfig>,
    shutdown_rx: ShutdownRx,
}

impl<S, D> ReplicationWorker<S, D>
where
    S: AuditStore + LeaseStore + Send + Sync + 'static,
    D: Destination + Send + Sync + 'static,
{
    pub fn new(
        replicator: Arc<Replicator<S, D>>,
        table_name: impl Into<String>,
        shutdown_rx: ShutdownRx,
    ) -> Self {
        let config = replicator.context().config.clone();

        Self {
            replicator,
            table_name: table_name.into(),
            config,
            shutdown_rx,
        }
    }

    /// Runs one pass: replicates batches until one comes back short, fails, or shutdown is
    /// requested. Returns the outcome of the last batch.
    pub async fn run_once(&self) -> CdcResult<BatchOutcome> {
        let batch_size = self.config.batch.max_size;

        loop {
            let outcome = self
                .replicator
                .replicate_changes(&self.table_name, batch_size)
                .await?;

            let batch_was_full = matches!(
                outcome,
                BatchOutcome::Synced { count } if count >= u64::try_from(batch_size).unwrap_or(u64::MAX)
            );
            if !batch_was_full || is_shutdown_requested(&self.shutdown_rx) {
                return Ok(outcome);
            }
        }
    }

    /// Spawns the polling loop on the current runtime.
    pub fn spawn(self) -> ReplicationWorkerHandle {
        let table_name = self.table_name.clone();
        let span = tracing::info_span!("replication_worker", table_name = %table_name);

        let handle = tokio::spawn(self.run().instrument(span.or_current()));

        ReplicationWorkerHandle {
            table_name,
            handle: Some(handle),
        }
    }

    async fn run(mut self) -> CdcResult<()> {
        info!("starting replication worker");
        let mut backoff = Backoff::from_config(&self.config.retry);

        loop {
            if is_shutdown_requested(&self.shutdown_rx) {
                break;
            }

            let delay = match self.run_once().await {
                Ok(outcome) if outcome.is_success() => {
                    backoff.reset();
                    self.config.poll_interval()
                }
                Ok(outcome) => {
                    let delay = backoff.next_delay();
                    info!(?outcome, ?delay, "replication pass failed, backing off");
                    delay
                }
                Err(err) => {
                    let delay = backoff.next_delay();
                    error!(error = %err, ?delay, "replication pass errored, backing off");
                    delay
                }
            };

            tokio::select! {
                biased;

                _ = self.shutdown_rx.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("replication worker stopped");

        Ok(())
    }
}
