//! Installation of capture hooks on source tables.

mod base;
mod memory;
pub(crate) mod postgres;
pub(crate) mod sqlite;

pub use base::{CaptureHandle, CaptureInstaller};
