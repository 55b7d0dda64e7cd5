//! Tracing setup shared by the change data capture binaries and tests.

pub mod tracing;
