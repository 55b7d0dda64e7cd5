//! Configuration types and loading for the change data capture services.

pub mod environment;
mod load;
mod secret;
pub mod shared;

pub use load::{Config, LoadConfigError, load_config, load_config_from};
pub use secret::SerializableSecretString;
