use std::sync::Arc;

use cdc_config::shared::ReplicationConfig;

use crate::clock::{SharedClock, SystemClock};
use crate::replication::outcome::OutcomeLog;

/// Everything a replicator and its monitor share.
///
/// Cloning is cheap: the store and destination are expected to be handles over shared state.
#[derive(Debug, Clone)]
pub struct CdcContext<S, D> {
    pub store: S,
    pub destination: D,
    pub config: Arc<ReplicationConfig>,
    pub clock: SharedClock,
    pub outcomes: OutcomeLog,
}

impl<S, D> CdcContext<S, D> {
    pub fn new(store: S, destination: D, config: ReplicationConfig) -> Self {
        Self::with_clock(store, destination, config, SystemClock::shared())
    }

    pub fn with_clock(
        store: S,
        destination: D,
        config: ReplicationConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            destination,
            config: Arc::new(config),
            clock,
            outcomes: OutcomeLog::new(),
        }
    }
}
