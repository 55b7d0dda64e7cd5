//! Utilities shared by the unit and integration tests.
//!
//! - [`fixtures`] builds the `users` source table, row images and test configurations.
//! - [`faulty_destination`] wraps a destination, injects systemic or record failures and holds
//!   transactions at a gate.
//! - `failpoints` configures fail points for the duration of a test.
//! - [`notify`] waits on notifications with a timeout so tests fail instead of hanging.

pub mod faulty_destination;
#[cfg(feature = "failpoints")]
pub mod failpoints;
pub mod fixtures;
pub mod notify;
