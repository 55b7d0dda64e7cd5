//! Targets that replicated changes are applied to.

mod base;
pub mod memory;
pub mod postgres;
pub mod sqlite;

pub use base::{Destination, DestinationTransaction};
pub(crate) use base::classify_target_error;
