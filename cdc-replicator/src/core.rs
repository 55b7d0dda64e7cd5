use std::sync::Arc;

use cdc::capture::CaptureInstaller;
use cdc::concurrency::shutdown::{ShutdownRx, ShutdownTx, create_shutdown_channel};
use cdc::destination::Destination;
use cdc::destination::memory::MemoryDestination;
use cdc::destination::postgres::PostgresDestination;
use cdc::destination::sqlite::SqliteDestination;
use cdc::error::CdcError;
use cdc::monitor::{HealthStatus, Monitor};
use cdc::replication::{CdcContext, ReplicatedTable, Replicator};
use cdc::store::postgres::PostgresStore;
use cdc::store::sqlite::SqliteStore;
use cdc::store::{AuditStore, LeaseStore};
use cdc::workers::{ReplicationWorker, ReplicationWorkerHandle};
use cdc_config::shared::{
    MonitorConfig, ReplicationConfig, ReplicatorConfig, StoreConfig, TableConfig,
};
use tokio::signal::unix::{SignalKind, signal};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ReplicatorError, ReplicatorResult};

/// Starts the replicator service with the provided configuration.
///
/// Connects the source audit store and the target, installs capture on every configured table
/// and runs one replication worker per table until a shutdown signal arrives.
pub async fn start_replicator_with_config(config: ReplicatorConfig) -> ReplicatorResult<()> {
    info!("starting replicator service");

    log_config(&config);

    let max_attempts = config.replication.retry.max_attempts;

    // Every source and target pair is spelled out so the pipeline stays statically dispatched.
    match (&config.source, &config.target) {
        (StoreConfig::Sqlite(source), StoreConfig::Memory) => {
            let store = SqliteStore::connect(source, max_attempts).await?;
            run_replicator(store, MemoryDestination::new(), config).await?;
        }
        (StoreConfig::Sqlite(source), StoreConfig::Sqlite(target)) => {
            let store = SqliteStore::connect(source, max_attempts).await?;
            let destination = SqliteDestination::connect(target).await?;
            run_replicator(store, destination, config).await?;
        }
        (StoreConfig::Sqlite(source), StoreConfig::Postgres(target)) => {
            let store = SqliteStore::connect(source, max_attempts).await?;
            let destination = PostgresDestination::connect(target).await?;
            run_replicator(store, destination, config).await?;
        }
        (StoreConfig::Postgres(source), StoreConfig::Memory) => {
            let store = PostgresStore::connect(source, max_attempts).await?;
            run_replicator(store, MemoryDestination::new(), config).await?;
        }
        (StoreConfig::Postgres(source), StoreConfig::Sqlite(target)) => {
            let store = PostgresStore::connect(source, max_attempts).await?;
            let destination = SqliteDestination::connect(target).await?;
            run_replicator(store, destination, config).await?;
        }
        (StoreConfig::Postgres(source), StoreConfig::Postgres(target)) => {
            let store = PostgresStore::connect(source, max_attempts).await?;
            let destination = PostgresDestination::connect(target).await?;
            run_replicator(store, destination, config).await?;
        }
        (StoreConfig::Memory, _) => {
            return Err(ReplicatorError::config(
                cdc_config::shared::ValidationError::UnsupportedMemorySource,
            ));
        }
    }

    info!("replicator service completed");

    Ok(())
}

#[tracing::instrument(skip_all, fields(destination = D::name()))]
async fn run_replicator<S, D>(
    store: S,
    destination: D,
    config: ReplicatorConfig,
) -> ReplicatorResult<()>
where
    S: AuditStore + LeaseStore + CaptureInstaller + Clone + Send + Sync + 'static,
    D: Destination + Send + Sync + 'static,
{
    let tables = install_capture(&store, &config.tables).await?;

    let context = CdcContext::new(store, destination, config.replication);
    let monitor = Monitor::from_context(&context, config.monitor.clone());

    let mut replicator = Replicator::new(context);
    for table in tables {
        replicator.register_table(table);
    }
    let replicator = Arc::new(replicator);
    info!(holder = %replicator.holder(), "replicator ready");

    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();

    let workers: Vec<ReplicationWorkerHandle> = replicator
        .tables()
        .map(|table| {
            ReplicationWorker::new(
                replicator.clone(),
                table.source_table.clone(),
                shutdown_rx.clone(),
            )
            .spawn()
        })
        .collect();

    let monitor_handle = config
        .monitor
        .enabled
        .then(|| spawn_monitor(monitor, config.monitor.clone(), shutdown_rx.clone()));

    let signal_handle = spawn_shutdown_listener(shutdown_tx.clone())?;

    let mut errors = Vec::new();
    for worker in workers {
        let table_name = worker.table_name().to_string();
        if let Err(err) = worker.wait().await {
            error!(table_name, error = %err, "replication worker failed");
            errors.push(err);
        }
    }

    // All workers are gone, so make sure the monitor stops as well.
    let _ = shutdown_tx.shutdown();
    if let Some(handle) = monitor_handle
        && let Err(err) = handle.await
    {
        warn!(error = %err, "monitor task did not finish cleanly");
    }
    signal_handle.abort();
    let _ = signal_handle.await;

    if let Err(err) = replicator.context().destination.shutdown().await {
        warn!(error = %err, "failed to shut down destination");
    }

    if !errors.is_empty() {
        return Err(CdcError::from(errors).into());
    }

    Ok(())
}

/// Installs capture on every configured table. All tables are attempted and their failures are
/// reported together.
async fn install_capture<S>(
    store: &S,
    tables: &[TableConfig],
) -> ReplicatorResult<Vec<ReplicatedTable>>
where
    S: CaptureInstaller,
{
    let mut replicated = Vec::with_capacity(tables.len());
    let mut errors = Vec::new();

    for table in tables {
        let columns: Vec<&str> = table.columns.iter().map(String::as_str).collect();

        match store.setup_capture(&table.source, &columns).await {
            Ok(handle) => {
                info!(
                    table_name = handle.table_name,
                    key_columns = ?handle.key_columns,
                    tracked_columns = ?handle.tracked_columns,
                    "capture installed"
                );
                replicated.push(ReplicatedTable::from_handle(&handle, table.target.as_deref()));
            }
            Err(err) => errors.push(err),
        }
    }

    if !errors.is_empty() {
        return Err(CdcError::from(errors).into());
    }

    Ok(replicated)
}

/// Periodically logs a health report until shutdown.
fn spawn_monitor<S>(
    monitor: Monitor<S>,
    config: MonitorConfig,
    mut shutdown_rx: ShutdownRx,
) -> JoinHandle<()>
where
    S: AuditStore + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => break,

                _ = tokio::time::sleep(config.interval()) => {}
            }

            match monitor.get_health_report().await {
                Ok(report) => {
                    let tables = serde_json::to_string(&report.tables).unwrap_or_default();
                    match report.status {
                        HealthStatus::Healthy => info!(
                            status = %report.status,
                            lag_seconds = report.lag_seconds,
                            pending_backlog = report.pending_backlog,
                            throughput = report.throughput_per_interval,
                            tables,
                            "health report"
                        ),
                        HealthStatus::Warning | HealthStatus::Critical => warn!(
                            status = %report.status,
                            lag_seconds = report.lag_seconds,
                            pending_backlog = report.pending_backlog,
                            dead_letter_count = report.dead_letter_count,
                            error_rate = report.error_rate,
                            tables,
                            "health report"
                        ),
                    }
                    debug!("\n{report}");
                }
                Err(err) => warn!(error = %err, "failed to build health report"),
            }
        }
    })
}

/// Listens for SIGTERM and SIGINT and signals every worker to stop after its in-flight batch.
fn spawn_shutdown_listener(shutdown_tx: ShutdownTx) -> ReplicatorResult<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("sigint (ctrl+c) received, shutting down replicator");
            }
            _ = sigterm.recv() => {
                info!("sigterm received, shutting down replicator");
            }
        }

        if let Err(err) = shutdown_tx.shutdown() {
            warn!(error = ?err, "failed to send shutdown signal");
        }
    }))
}

fn log_config(config: &ReplicatorConfig) {
    log_store_config("source", &config.source);
    log_store_config("target", &config.target);
    for table in &config.tables {
        debug!(
            source = table.source,
            target = table.target_table(),
            columns = ?table.columns,
            "table config"
        );
    }
    log_replication_config(&config.replication);
    debug!(
        enabled = config.monitor.enabled,
        interval_secs = config.monitor.interval_secs,
        backlog_warning_threshold = config.monitor.backlog_warning_threshold,
        "monitor config"
    );
}

fn log_store_config(side: &str, config: &StoreConfig) {
    match config {
        StoreConfig::Memory => debug!(side, "using memory store config"),
        StoreConfig::Sqlite(sqlite) => debug!(
            side,
            path = %sqlite.path.display(),
            create_if_missing = sqlite.create_if_missing,
            "using sqlite store config"
        ),
        StoreConfig::Postgres(postgres) => debug!(
            side,
            host = postgres.host,
            port = postgres.port,
            dbname = postgres.name,
            username = postgres.username,
            "using postgres store config"
        ),
    }
}

fn log_replication_config(config: &ReplicationConfig) {
    debug!(
        batch_size = config.batch.max_size,
        poll_interval_ms = config.poll_interval_ms,
        max_attempts = config.retry.max_attempts,
        initial_delay_ms = config.retry.initial_delay_ms,
        max_delay_ms = config.retry.max_delay_ms,
        backoff_factor = config.retry.backoff_factor,
        lease_timeout_ms = config.lease.timeout_ms,
        "replication config"
    );
}

#[cfg(test)]
mod tests {
    use cdc::error::ErrorKind;
    use cdc::store::memory::MemoryDatabase;
    use cdc::test_utils::fixtures::{USERS_REPLICA_TABLE, USERS_TABLE, create_captured_users};

    use super::*;

    fn table(source: &str, target: Option<&str>) -> TableConfig {
        TableConfig {
            source: source.to_string(),
            target: target.map(str::to_string),
            columns: vec![],
        }
    }

    #[tokio::test]
    async fn install_capture_maps_tables_to_targets() {
        let database = MemoryDatabase::new();
        create_captured_users(&database).await.unwrap();

        let tables = install_capture(&database, &[table(USERS_TABLE, Some(USERS_REPLICA_TABLE))])
            .await
            .unwrap();

        assert_eq!(
            tables,
            vec![ReplicatedTable::new(
                USERS_TABLE,
                USERS_REPLICA_TABLE,
                vec!["id".to_string()]
            )]
        );
    }

    #[tokio::test]
    async fn install_capture_reports_every_failing_table() {
        let database = MemoryDatabase::new();
        create_captured_users(&database).await.unwrap();

        let err = install_capture(
            &database,
            &[
                table("orders", None),
                table(USERS_TABLE, None),
                table("invoices", None),
            ],
        )
        .await
        .unwrap_err();

        let ReplicatorError::Cdc(err) = err else {
            panic!("expected a replication error, got {err:?}");
        };
        assert_eq!(err.kinds(), vec![ErrorKind::SetupFailed, ErrorKind::SetupFailed]);
    }
}
