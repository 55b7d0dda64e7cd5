//! Change data capture replicator service.
//!
//! Installs capture triggers on the configured source tables and keeps their target copies in
//! sync, logging a periodic health report until it receives SIGTERM or SIGINT.

use cdc_config::shared::ReplicatorConfig;
use cdc_telemetry::tracing::init_tracing;
use tracing::error;

use crate::config::load_replicator_config;
use crate::core::start_replicator_with_config;
use crate::error::{ReplicatorError, ReplicatorResult};

mod config;
mod core;
mod error;

fn main() -> ReplicatorResult<()> {
    let replicator_config = match load_replicator_config() {
        Ok(config) => config,
        Err(err) => {
            // Tracing is not installed yet, so the report goes straight to stderr.
            eprint!("{}", err.render_report());
            return Err(err);
        }
    };

    init_tracing(env!("CARGO_BIN_NAME")).map_err(ReplicatorError::config)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))?;

    Ok(())
}

async fn async_main(replicator_config: ReplicatorConfig) -> ReplicatorResult<()> {
    if let Err(err) = start_replicator_with_config(replicator_config).await {
        error!("{err}");
        eprint!("{}", err.render_report());

        return Err(err);
    }

    Ok(())
}
