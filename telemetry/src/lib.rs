use std::sync::Once;

use thiserror::Error;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Filter applied when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Filter applied to tests when `RUST_LOG` is not set.
const DEFAULT_TEST_FILTER: &str = "branching=debug,api=debug,postgres=debug";

static TEST_TRACING: Once = Once::new();

/// Errors that can happen while installing the global subscriber.
#[derive(Debug, Error)]
pub enum TracingError {
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing_subscriber::util::TryInitError),
}

/// Installs the global tracing subscriber for a harness binary.
///
/// Logs go to stderr through the `fmt` layer. The filter comes from `RUST_LOG`, defaulting to
/// `info` plus `debug` for `service`.
pub fn init_tracing(service: &str) -> Result<(), TracingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{DEFAULT_FILTER},{service}=debug")));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .try_init()?;

    Ok(())
}

/// Installs a subscriber writing through the test harness so output is captured per test.
///
/// Safe to call from every test, only the first call installs anything.
pub fn init_test_tracing() {
    TEST_TRACING.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_TEST_FILTER));

        // Another subscriber may already be installed by the harness, in which case we keep it.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_test_writer())
            .try_init();
    });
}
