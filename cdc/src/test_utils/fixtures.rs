use std::sync::Arc;

use cdc_config::shared::{BatchConfig, LeaseConfig, ReplicationConfig, RetryConfig};
use serde_json::json;

use crate::capture::{CaptureHandle, CaptureInstaller};
use crate::clock::ManualClock;
use crate::destination::Destination;
use crate::error::CdcResult;
use crate::replication::{CdcContext, ReplicatedTable, Replicator};
use crate::store::memory::MemoryDatabase;
use crate::store::{AuditStore, LeaseStore};
use crate::types::{RowImage, row_image};

pub const USERS_TABLE: &str = "users";
pub const USERS_REPLICA_TABLE: &str = "users_replica";
pub const USERS_COLUMNS: [&str; 3] = ["id", "name", "email"];

/// Key columns of the `users` table.
pub fn users_key() -> Vec<String> {
    vec!["id".to_string()]
}

pub fn user(id: i64, name: &str, email: &str) -> RowImage {
    row_image([
        ("id", json!(id)),
        ("name", json!(name)),
        ("email", json!(email)),
    ])
}

pub fn user_key(id: i64) -> RowImage {
    row_image([("id", json!(id))])
}

/// Replication settings with short delays, suitable for paused-time tests.
pub fn test_replication_config(batch_size: usize, max_attempts: u32) -> ReplicationConfig {
    ReplicationConfig {
        batch: BatchConfig {
            max_size: batch_size,
        },
        retry: RetryConfig {
            max_attempts,
            initial_delay_ms: 1_000,
            max_delay_ms: 8_000,
            backoff_factor: 2.0,
        },
        lease: LeaseConfig { timeout_ms: 30_000 },
        poll_interval_ms: 500,
    }
}

/// Creates the `users` table in a memory database and installs capture on it.
pub async fn create_captured_users(database: &MemoryDatabase) -> CdcResult<CaptureHandle> {
    database
        .create_table(USERS_TABLE, &USERS_COLUMNS, &["id"])
        .await?;

    database.setup_capture(USERS_TABLE, &[]).await
}

/// Memory source database with a captured `users` table, driven by a manual clock.
pub async fn memory_source(clock: &ManualClock, max_attempts: u32) -> CdcResult<MemoryDatabase> {
    let database = MemoryDatabase::with_clock(Arc::new(clock.clone()), max_attempts);
    create_captured_users(&database).await?;

    Ok(database)
}

/// Builds a replicator over `store` and `destination` replicating `users` into `users_replica`.
pub fn users_replicator<S, D>(
    store: S,
    destination: D,
    config: ReplicationConfig,
    clock: &ManualClock,
) -> Replicator<S, D>
where
    S: AuditStore + LeaseStore + Sync,
    D: Destination + Sync,
{
    let context = CdcContext::with_clock(store, destination, config, Arc::new(clock.clone()));
    let mut replicator = Replicator::new(context);
    replicator.register_table(ReplicatedTable::new(
        USERS_TABLE,
        USERS_REPLICA_TABLE,
        users_key(),
    ));

    replicator
}
