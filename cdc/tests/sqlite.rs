#![cfg(feature = "test-utils")]

use std::sync::Arc;
use std::time::Duration;

use cdc::capture::CaptureInstaller;
use cdc::clock::{Clock, ManualClock};
use cdc::destination::sqlite::SqliteDestination;
use cdc::error::ErrorKind;
use cdc::replication::BatchOutcome;
use cdc::store::sqlite::SqliteStore;
use cdc::store::{AuditStore, LeaseStore};
use cdc::test_utils::fixtures::{USERS_TABLE, test_replication_config, users_replicator};
use cdc::types::{ChangeStatus, Operation, RowChange};
use cdc_config::shared::{IntoConnectOptions, SqliteConnectionConfig};
use cdc_telemetry::tracing::init_test_tracing;
use chrono::{TimeZone, Utc};
use serde_json::json;
use sqlx::SqlitePool;
use tempfile::TempDir;
use uuid::Uuid;

type UserRow = (i64, String, Option<String>);

struct TestDatabases {
    // Keeps the database files alive for the duration of the test.
    _directory: TempDir,
    source: SqliteStore,
    target: SqliteDestination,
}

async fn setup() -> TestDatabases {
    init_test_tracing();
    let directory = tempfile::tempdir().unwrap();

    let source = SqliteStore::connect(
        &SqliteConnectionConfig::new(directory.path().join("source.db")),
        3,
    )
    .await
    .unwrap();
    sqlx::query("create table users (id integer primary key, name text not null, email text)")
        .execute(source.pool())
        .await
        .unwrap();

    let target = SqliteDestination::connect(&SqliteConnectionConfig::new(
        directory.path().join("target.db"),
    ))
    .await
    .unwrap();
    sqlx::query(
        "create table users_replica (id integer primary key, name text not null check (name <> 'poison'), email text)",
    )
    .execute(target.pool())
    .await
    .unwrap();

    TestDatabases {
        _directory: directory,
        source,
        target,
    }
}

async fn execute(pool: &SqlitePool, statement: &str) {
    sqlx::query(statement).execute(pool).await.unwrap();
}

async fn users(pool: &SqlitePool, table: &str) -> Vec<UserRow> {
    sqlx::query_as(&format!("select id, name, email from {table} order by id"))
        .fetch_all(pool)
        .await
        .unwrap()
}

#[tokio::test]
async fn triggers_capture_images_in_order() {
    let databases = setup().await;
    let source = &databases.source;
    let handle = source.setup_capture(USERS_TABLE, &[]).await.unwrap();
    assert_eq!(handle.key_columns, vec!["id".to_string()]);

    execute(source.pool(), "insert into users (id, name, email) values (1, 'Ana', 'ana@example.com')").await;
    execute(source.pool(), "update users set name = 'Ana Maria' where id = 1").await;
    execute(source.pool(), "delete from users where id = 1").await;

    let pending = source.get_pending_changes(USERS_TABLE, 10).await.unwrap();
    let operations: Vec<_> = pending.iter().map(|change| change.operation()).collect();
    assert_eq!(operations, vec![Operation::Insert, Operation::Update, Operation::Delete]);
    assert!(pending.windows(2).all(|pair| pair[0].id < pair[1].id));

    let RowChange::Update { before, after } = &pending[1].change else {
        panic!("expected an update, got {:?}", pending[1].change);
    };
    assert_eq!(before["name"], json!("Ana"));
    assert_eq!(after["name"], json!("Ana Maria"));
    assert_eq!(after["id"], json!(1));
    assert!(pending.iter().all(|change| change.status == ChangeStatus::Pending));
}

#[tokio::test]
async fn worked_example_replicates_to_an_empty_target() {
    let databases = setup().await;
    let source = &databases.source;
    source.setup_capture(USERS_TABLE, &[]).await.unwrap();

    execute(source.pool(), "insert into users (id, name, email) values (1, 'Ana', 'ana@example.com')").await;
    execute(source.pool(), "update users set email = 'ana@example.org' where id = 1").await;
    execute(source.pool(), "delete from users where id = 1").await;

    let clock = ManualClock::default();
    let replicator = users_replicator(
        source.clone(),
        databases.target.clone(),
        test_replication_config(10, 3),
        &clock,
    );
    let outcome = replicator.replicate_changes(USERS_TABLE, 10).await.unwrap();

    assert_eq!(outcome, BatchOutcome::Synced { count: 3 });
    assert!(users(databases.target.pool(), "users_replica").await.is_empty());

    let statistics = source.get_statistics(USERS_TABLE).await.unwrap();
    assert_eq!(statistics.pending_count, 0);
    assert_eq!(statistics.synced_count, 3);
    assert_eq!(statistics.dead_letter_count, 0);
}

#[tokio::test]
async fn target_converges_to_source() {
    let databases = setup().await;
    let source = &databases.source;
    source.setup_capture(USERS_TABLE, &[]).await.unwrap();

    for id in 1..=5 {
        execute(
            source.pool(),
            &format!("insert into users (id, name, email) values ({id}, 'user {id}', null)"),
        )
        .await;
    }
    execute(source.pool(), "update users set email = 'x@example.com' where id in (2, 3)").await;
    execute(source.pool(), "update users set id = 10 where id = 4").await;
    execute(source.pool(), "delete from users where id = 5").await;

    let clock = ManualClock::default();
    let replicator = users_replicator(
        source.clone(),
        databases.target.clone(),
        test_replication_config(2, 3),
        &clock,
    );
    while replicator.replicate_changes(USERS_TABLE, 2).await.unwrap() != BatchOutcome::Idle {}

    assert_eq!(
        users(databases.target.pool(), "users_replica").await,
        users(source.pool(), "users").await
    );
}

#[tokio::test]
async fn failing_record_is_dead_lettered_after_the_retry_ceiling() {
    let databases = setup().await;
    let source = &databases.source;
    source.setup_capture(USERS_TABLE, &[]).await.unwrap();
    execute(source.pool(), "insert into users (id, name) values (1, 'poison')").await;

    let clock = ManualClock::default();
    let replicator = users_replicator(
        source.clone(),
        databases.target.clone(),
        test_replication_config(10, 3),
        &clock,
    );

    let mut outcome = BatchOutcome::Idle;
    for _ in 0..4 {
        outcome = replicator.replicate_changes(USERS_TABLE, 10).await.unwrap();
    }
    assert_eq!(
        outcome,
        BatchOutcome::RecordFailed {
            change_id: 1,
            attempt_count: 4,
            dead_lettered: true,
        }
    );
    assert_eq!(
        replicator.replicate_changes(USERS_TABLE, 10).await.unwrap(),
        BatchOutcome::Idle
    );

    let change = source.get_change(1).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::DeadLetter);
    assert!(change.last_error.unwrap().contains("ApplyFailed"));

    assert_eq!(source.requeue_dead_letters(USERS_TABLE).await.unwrap(), 1);
    let change = source.get_change(1).await.unwrap().unwrap();
    assert_eq!(change.status, ChangeStatus::Pending);
    assert_eq!(change.attempt_count, 0);
}

#[tokio::test]
async fn failed_capture_rolls_back_the_mutation() {
    let databases = setup().await;
    let source = &databases.source;
    source.setup_capture(USERS_TABLE, &[]).await.unwrap();
    execute(source.pool(), "drop table cdc_changes").await;

    let result = sqlx::query("insert into users (id, name) values (1, 'Ana')")
        .execute(source.pool())
        .await;

    assert!(result.is_err());
    assert!(users(source.pool(), "users").await.is_empty());
}

#[tokio::test]
async fn capture_setup_follows_key_rules() {
    let databases = setup().await;
    let source = &databases.source;
    execute(source.pool(), "create table events (payload text)").await;
    execute(source.pool(), "create table accounts (email text not null unique, name text)").await;
    execute(source.pool(), "create table contacts (phone text unique, name text)").await;

    for table in ["events", "contacts", "missing"] {
        let err = source.setup_capture(table, &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SetupFailed, "table {table}");
    }
    let err = source.setup_capture(USERS_TABLE, &["age"]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SetupFailed);

    let accounts = source.setup_capture("accounts", &["name"]).await.unwrap();
    assert_eq!(accounts.key_columns, vec!["email".to_string()]);
    assert_eq!(
        accounts.tracked_columns,
        vec!["email".to_string(), "name".to_string()]
    );

    let users = source.setup_capture(USERS_TABLE, &["name"]).await.unwrap();
    assert_eq!(users.tracked_columns, vec!["id".to_string(), "name".to_string()]);
    assert_eq!(source.setup_capture(USERS_TABLE, &[]).await.unwrap(), users);
    assert_eq!(source.captured_tables().await.unwrap(), vec![accounts, users]);

    // Untracked columns stay out of the images.
    execute(source.pool(), "insert into users (id, name, email) values (1, 'Ana', 'ana@example.com')").await;
    let pending = source.get_pending_changes(USERS_TABLE, 10).await.unwrap();
    assert!(!pending[0].change.after_image().unwrap().contains_key("email"));
}

#[tokio::test]
async fn primary_key_must_be_non_nullable_to_key_captures() {
    let databases = setup().await;
    let source = &databases.source;
    execute(source.pool(), "create table codes (code text primary key, label text)").await;
    execute(source.pool(), "create table tags (slug text not null primary key, label text)").await;
    execute(
        source.pool(),
        "create table skus (code text primary key, sku text not null unique, label text)",
    )
    .await;

    let err = source.setup_capture("codes", &[]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SetupFailed);

    let tags = source.setup_capture("tags", &[]).await.unwrap();
    assert_eq!(tags.key_columns, vec!["slug".to_string()]);

    let skus = source.setup_capture("skus", &[]).await.unwrap();
    assert_eq!(skus.key_columns, vec!["sku".to_string()]);

    // A lone INTEGER PRIMARY KEY is the rowid and never NULL.
    let users = source.setup_capture(USERS_TABLE, &[]).await.unwrap();
    assert_eq!(users.key_columns, vec!["id".to_string()]);
}

#[tokio::test]
async fn capture_registry_is_stamped_by_the_store_clock() {
    init_test_tracing();
    let directory = tempfile::tempdir().unwrap();
    let pool = SqlitePool::connect_with(
        SqliteConnectionConfig::new(directory.path().join("clocked.db")).connect_options(),
    )
    .await
    .unwrap();
    let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
    let store = SqliteStore::new(pool, Arc::new(clock.clone()), 3);
    store.migrate().await.unwrap();
    execute(store.pool(), "create table users (id integer primary key, name text not null)").await;

    store.setup_capture(USERS_TABLE, &[]).await.unwrap();

    let installed_at: i64 =
        sqlx::query_scalar("select installed_at from cdc_captured_tables where table_name = ?")
            .bind(USERS_TABLE)
            .fetch_one(store.pool())
            .await
            .unwrap();
    assert_eq!(installed_at, clock.now().timestamp_millis());
}

#[tokio::test]
async fn removed_capture_stops_recording() {
    let databases = setup().await;
    let source = &databases.source;
    source.setup_capture(USERS_TABLE, &[]).await.unwrap();
    execute(source.pool(), "insert into users (id, name) values (1, 'Ana')").await;

    assert!(source.remove_capture(USERS_TABLE).await.unwrap());
    assert!(!source.remove_capture(USERS_TABLE).await.unwrap());
    execute(source.pool(), "insert into users (id, name) values (2, 'Bea')").await;

    assert!(source.captured_tables().await.unwrap().is_empty());
    assert_eq!(source.get_pending_changes(USERS_TABLE, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn leases_are_exclusive_and_fenced() {
    let databases = setup().await;
    let source = &databases.source;
    let ttl = Duration::from_secs(30);
    let (first, second) = (Uuid::new_v4(), Uuid::new_v4());

    let lease = source.acquire_lease(USERS_TABLE, first, ttl).await.unwrap().unwrap();
    assert_eq!(lease.fencing_token, 1);
    assert!(source.acquire_lease(USERS_TABLE, second, ttl).await.unwrap().is_none());
    // A live lease is not re-entrant, not even for its holder.
    assert!(source.acquire_lease(USERS_TABLE, first, ttl).await.unwrap().is_none());

    assert!(source.release_lease(&lease).await.unwrap());

    let taken = source.acquire_lease(USERS_TABLE, second, ttl).await.unwrap().unwrap();
    assert_eq!(taken.fencing_token, 2);
    assert!(!source.release_lease(&lease).await.unwrap());

    let err = source.mark_as_synced(&lease, &[1]).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LeaseLost);
    let err = source.mark_as_failed(&lease, &[1], "boom").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LeaseLost);
    assert_eq!(source.mark_as_synced(&taken, &[1]).await.unwrap(), 0);
}
