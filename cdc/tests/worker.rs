#![cfg(feature = "test-utils")]

use std::sync::Arc;
use std::time::Duration;

use cdc::clock::ManualClock;
use cdc::concurrency::shutdown::create_shutdown_channel;
use cdc::destination::memory::MemoryDestination;
use cdc::replication::BatchOutcome;
use cdc::store::AuditStore;
use cdc::types::ChangeStatus;
use cdc::test_utils::faulty_destination::{Fault, FaultyDestination, GatePoint};
use cdc::test_utils::fixtures::{
    USERS_REPLICA_TABLE, USERS_TABLE, memory_source, test_replication_config, user,
    users_replicator,
};
use cdc::workers::ReplicationWorker;
use cdc_telemetry::tracing::init_test_tracing;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn worker_replicates_pending_changes_until_shutdown() {
    init_test_tracing();
    let clock = ManualClock::default();
    let source = memory_source(&clock, 3).await.unwrap();
    let destination = FaultyDestination::wrap(MemoryDestination::new());
    let committed = destination.notify_on_commit();

    source
        .insert(USERS_TABLE, user(1, "Ana", "ana@example.com"))
        .await
        .unwrap();

    let replicator = Arc::new(users_replicator(
        source.clone(),
        destination.clone(),
        test_replication_config(10, 3),
        &clock,
    ));
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handle = ReplicationWorker::new(replicator, USERS_TABLE, shutdown_rx).spawn();

    committed.notified().await;

    // Changes captured while the worker sleeps are picked up by the next poll.
    source
        .insert(USERS_TABLE, user(2, "Bea", "bea@example.com"))
        .await
        .unwrap();
    committed.notified().await;

    shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();

    assert_eq!(destination.inner().rows(USERS_REPLICA_TABLE).await.len(), 2);
    let statistics = source.get_statistics(USERS_TABLE).await.unwrap();
    assert_eq!(statistics.synced_count, 2);
}

#[tokio::test(start_paused = true)]
async fn worker_backs_off_exponentially_while_the_target_is_down() {
    init_test_tracing();
    let clock = ManualClock::default();
    let source = memory_source(&clock, 3).await.unwrap();
    let destination = FaultyDestination::wrap(MemoryDestination::new());
    destination.inject(Fault::Begin).await;
    let committed = destination.notify_on_commit();

    source
        .insert(USERS_TABLE, user(1, "Ana", "ana@example.com"))
        .await
        .unwrap();

    let replicator = Arc::new(users_replicator(
        source.clone(),
        destination.clone(),
        test_replication_config(10, 3),
        &clock,
    ));
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let start = Instant::now();
    let handle = ReplicationWorker::new(replicator, USERS_TABLE, shutdown_rx).spawn();

    // Passes fail at 0s, 1s and 3s; the next one is due at 7s.
    tokio::time::sleep(Duration::from_millis(3_500)).await;
    destination.clear_faults().await;
    committed.notified().await;

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_secs(7), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(8), "elapsed {elapsed:?}");

    // Systemic failures never count against the record.
    let change = source.get_change(1).await.unwrap().unwrap();
    assert_eq!(change.attempt_count, 0);

    shutdown_tx.shutdown().unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn run_once_drains_while_batches_are_full() {
    let clock = ManualClock::default();
    let source = memory_source(&clock, 3).await.unwrap();
    let destination = MemoryDestination::new();
    for id in 1..=5 {
        source
            .insert(USERS_TABLE, user(id, "user", "user@example.com"))
            .await
            .unwrap();
    }

    let replicator = Arc::new(users_replicator(
        source.clone(),
        destination.clone(),
        test_replication_config(2, 3),
        &clock,
    ));
    let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let worker = ReplicationWorker::new(replicator, USERS_TABLE, shutdown_rx);

    let outcome = worker.run_once().await.unwrap();

    assert_eq!(outcome, BatchOutcome::Synced { count: 1 });
    assert_eq!(destination.rows(USERS_REPLICA_TABLE).await.len(), 5);
    assert_eq!(worker.run_once().await.unwrap(), BatchOutcome::Idle);
}

#[tokio::test(start_paused = true)]
async fn idle_worker_stops_on_shutdown() {
    let clock = ManualClock::default();
    let source = memory_source(&clock, 3).await.unwrap();
    let replicator = Arc::new(users_replicator(
        source,
        MemoryDestination::new(),
        test_replication_config(10, 3),
        &clock,
    ));
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handle = ReplicationWorker::new(replicator, USERS_TABLE, shutdown_rx).spawn();

    tokio::time::sleep(Duration::from_secs(2)).await;
    shutdown_tx.shutdown().unwrap();

    handle.wait().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn shutdown_during_a_batch_lets_it_finish_and_starts_no_other() {
    init_test_tracing();
    let clock = ManualClock::default();
    let source = memory_source(&clock, 3).await.unwrap();
    let destination = FaultyDestination::wrap(MemoryDestination::new());

    source
        .insert(USERS_TABLE, user(1, "Ana", "ana@example.com"))
        .await
        .unwrap();
    source
        .insert(USERS_TABLE, user(2, "Bea", "bea@example.com"))
        .await
        .unwrap();
    let ids: Vec<_> = source
        .get_pending_changes(USERS_TABLE, 10)
        .await
        .unwrap()
        .iter()
        .map(|change| change.id)
        .collect();

    // With a batch size of one the first batch is full, so only shutdown stops a second one.
    let gate = destination.hold_at(GatePoint::Commit).await;
    let replicator = Arc::new(users_replicator(
        source.clone(),
        destination.clone(),
        test_replication_config(1, 3),
        &clock,
    ));
    let (shutdown_tx, shutdown_rx) = create_shutdown_channel();
    let handle = ReplicationWorker::new(replicator, USERS_TABLE, shutdown_rx).spawn();

    gate.reached().await;
    shutdown_tx.shutdown().unwrap();
    gate.release();
    handle.wait().await.unwrap();

    assert_eq!(destination.commits().await, 1);
    assert_eq!(
        destination.inner().rows(USERS_REPLICA_TABLE).await,
        vec![user(1, "Ana", "ana@example.com")]
    );

    let first = source.get_change(ids[0]).await.unwrap().unwrap();
    assert_eq!(first.status, ChangeStatus::Synced);
    let second = source.get_change(ids[1]).await.unwrap().unwrap();
    assert_eq!(second.status, ChangeStatus::Pending);
    assert_eq!(second.attempt_count, 0);
}
