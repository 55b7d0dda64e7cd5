#![cfg(all(feature = "test-utils", feature = "failpoints"))]

use cdc::clock::ManualClock;
use cdc::destination::memory::MemoryDestination;
use cdc::error::ErrorKind;
use cdc::failpoints::{
    CAPTURE_BEFORE_APPEND, REPLICATOR_AFTER_TARGET_COMMIT, REPLICATOR_BEFORE_APPLY,
};
use cdc::replication::BatchOutcome;
use cdc::store::AuditStore;
use cdc::test_utils::failpoints::FailPointGuard;
use cdc::test_utils::fixtures::{
    USERS_REPLICA_TABLE, USERS_TABLE, memory_source, test_replication_config, user,
    users_replicator,
};
use cdc::types::ChangeStatus;
use cdc_telemetry::tracing::init_test_tracing;

#[tokio::test]
async fn failing_capture_rolls_back_the_mutation() {
    init_test_tracing();
    let _guard = FailPointGuard::configure(&[(CAPTURE_BEFORE_APPEND, "return")]);

    let clock = ManualClock::default();
    let source = memory_source(&clock, 3).await.unwrap();

    let err = source
        .insert(USERS_TABLE, user(1, "Ana", "ana@example.com"))
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::CaptureFailed);
    assert!(source.rows(USERS_TABLE).await.unwrap().is_empty());
    assert!(
        source
            .get_pending_changes(USERS_TABLE, 10)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn record_failure_before_apply_counts_an_attempt() {
    init_test_tracing();
    let _guard = FailPointGuard::configure(&[(REPLICATOR_BEFORE_APPLY, "return(record)")]);

    let clock = ManualClock::default();
    let source = memory_source(&clock, 3).await.unwrap();
    source
        .insert(USERS_TABLE, user(1, "Ana", "ana@example.com"))
        .await
        .unwrap();
    let change_id = source.get_pending_changes(USERS_TABLE, 1).await.unwrap()[0].id;

    let destination = MemoryDestination::new();
    let replicator = users_replicator(
        source.clone(),
        destination.clone(),
        test_replication_config(10, 3),
        &clock,
    );
    let outcome = replicator.replicate_changes(USERS_TABLE, 10).await.unwrap();

    assert_eq!(
        outcome,
        BatchOutcome::RecordFailed {
            change_id,
            attempt_count: 1,
            dead_lettered: false,
        }
    );
    let change = source.get_change(change_id).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Failed);
    assert!(destination.rows(USERS_REPLICA_TABLE).await.is_empty());
}

#[tokio::test]
async fn systemic_failure_before_apply_aborts_without_an_attempt() {
    init_test_tracing();
    let _guard = FailPointGuard::configure(&[(REPLICATOR_BEFORE_APPLY, "return")]);

    let clock = ManualClock::default();
    let source = memory_source(&clock, 3).await.unwrap();
    source
        .insert(USERS_TABLE, user(1, "Ana", "ana@example.com"))
        .await
        .unwrap();

    let replicator = users_replicator(
        source.clone(),
        MemoryDestination::new(),
        test_replication_config(10, 3),
        &clock,
    );
    let outcome = replicator.replicate_changes(USERS_TABLE, 10).await.unwrap();

    let BatchOutcome::Aborted { error } = outcome else {
        panic!("expected an aborted batch, got {outcome:?}");
    };
    assert_eq!(error.kind(), ErrorKind::WithSystemicFailure);

    let pending = source.get_pending_changes(USERS_TABLE, 10).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_count, 0);
    assert_eq!(pending[0].status, ChangeStatus::Pending);
}

#[tokio::test]
async fn crash_after_target_commit_reapplies_on_the_next_pass() {
    init_test_tracing();
    let guard = FailPointGuard::configure(&[(REPLICATOR_AFTER_TARGET_COMMIT, "return")]);

    let clock = ManualClock::default();
    let source = memory_source(&clock, 3).await.unwrap();
    source
        .insert(USERS_TABLE, user(1, "Ana", "ana@example.com"))
        .await
        .unwrap();

    let destination = MemoryDestination::new();
    let replicator = users_replicator(
        source.clone(),
        destination.clone(),
        test_replication_config(10, 3),
        &clock,
    );

    let err = replicator
        .replicate_changes(USERS_TABLE, 10)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::WithSystemicFailure);
    // The target already holds the row while the audit log still lists it as pending.
    assert_eq!(destination.rows(USERS_REPLICA_TABLE).await.len(), 1);
    assert_eq!(
        source.get_pending_changes(USERS_TABLE, 10).await.unwrap().len(),
        1
    );

    guard.disable(REPLICATOR_AFTER_TARGET_COMMIT);
    let outcome = replicator.replicate_changes(USERS_TABLE, 10).await.unwrap();

    assert_eq!(outcome, BatchOutcome::Synced { count: 1 });
    assert_eq!(
        destination.rows(USERS_REPLICA_TABLE).await,
        vec![user(1, "Ana", "ana@example.com")]
    );
}
