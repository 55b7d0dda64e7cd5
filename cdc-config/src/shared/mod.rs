//! Configuration types shared by the library and the replicator service.

mod base;
mod batch;
mod connection;
mod lease;
mod monitor;
mod replication;
mod replicator;
mod retry;
mod table;

pub use base::ValidationError;
pub use batch::BatchConfig;
pub use connection::{IntoConnectOptions, PgConnectionConfig, SqliteConnectionConfig, StoreConfig};
pub use lease::LeaseConfig;
pub use monitor::MonitorConfig;
pub use replication::ReplicationConfig;
pub use replicator::ReplicatorConfig;
pub use retry::RetryConfig;
pub use table::TableConfig;
