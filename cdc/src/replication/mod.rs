//! Draining of the audit log into a destination.

pub mod backoff;
pub mod context;
pub mod outcome;
pub mod policy;
mod replicator;

pub use context::CdcContext;
pub use outcome::{BatchOutcome, OutcomeLog, RecordedOutcome};
pub use replicator::{ReplicatedTable, Replicator};
