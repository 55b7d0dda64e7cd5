//! Coordination primitives for workers.

pub mod shutdown;
