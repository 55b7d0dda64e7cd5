use std::sync::Once;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt};

/// Log level used by [`init_test_tracing`] when `RUST_LOG` is not set.
const DEFAULT_TEST_FILTER: &str = "cdc=debug";

static INIT_TEST_TRACING: Once = Once::new();

/// Installs the global subscriber for a service.
///
/// The filter is read from `RUST_LOG`, falling back to `info` for the given application and
/// `warn` for everything else.
pub fn init_tracing(app_name: &str) -> Result<(), TryInitError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,{app_name}=info,cdc=info")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()
}

/// Installs a test-friendly subscriber once per process.
///
/// Output goes through the test writer so it is captured per test unless `--nocapture` is used.
pub fn init_test_tracing() {
    INIT_TEST_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_TEST_FILTER));

        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_test_writer())
            .try_init();
    });
}
