//! Background tasks driving replication.

pub mod replication;

pub use replication::{ReplicationWorker, ReplicationWorkerHandle};
