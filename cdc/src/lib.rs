//! Trigger-based change data capture.
//!
//! Capture hooks installed on source tables append every mutation to an audit log inside the
//! mutating transaction. A [`replication::Replicator`] drains that log in batches into a
//! [`destination::Destination`], under a per-table apply-lease, and a [`monitor::Monitor`]
//! derives health reports from the log and the recent replication outcomes.
//!
//! Three engines implement the storage traits: an in-process memory engine, SQLite and Postgres.

pub mod capture;
pub mod clock;
pub mod concurrency;
pub mod destination;
pub mod error;
pub mod failpoints;
mod macros;
pub mod monitor;
pub mod replication;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
