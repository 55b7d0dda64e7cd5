//! Audit storage and apply-lease coordination.
//!
//! Every engine keeps the audit log and the leases side by side, so the lease check of a status
//! update runs in the same transaction as the update itself.

pub mod audit;
pub mod lease;
pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use audit::AuditStore;
pub use lease::{ApplyLease, LeaseStore};
