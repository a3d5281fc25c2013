//! Logging setup for harness runs
//!
//! Plain tracing output to stderr, filtered by `RUST_LOG`.
//!
//! # Example
//!
//! ```no_run
//! use sharecheck::telemetry::init_logging;
//!
//! init_logging();
//! // RUST_LOG=sharecheck=debug shows every poll attempt
//! ```

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default filter when `RUST_LOG` is unset
const DEFAULT_FILTER: &str = "info";

/// Initialize logging with tracing-subscriber
///
/// Safe to call from every test; only the first call installs a subscriber.
pub fn init_logging() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER)))
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}
