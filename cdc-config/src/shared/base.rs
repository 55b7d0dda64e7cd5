use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A field holds a value outside of its allowed range.
    #[error("invalid value for `{field}`: {constraint}")]
    InvalidFieldValue { field: String, constraint: String },
    /// No table was configured for replication.
    #[error("at least one table must be configured for replication")]
    NoTablesConfigured,
    /// The same source table was configured more than once.
    #[error("source table `{0}` is configured more than once")]
    DuplicateSourceTable(String),
    /// The memory engine cannot act as a source outside of the process that owns it.
    #[error("the memory engine cannot be used as the replicator source")]
    UnsupportedMemorySource,
}
