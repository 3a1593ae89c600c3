//! Tracing subscriber setup.

use thiserror::Error;
use tracing_subscriber::{fmt, EnvFilter};

/// Failure to install the global subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    /// The filter directive did not parse.
    #[error("invalid log filter: {0}")]
    InvalidFilter(String),
    /// Another subscriber is already installed.
    #[error("logging already initialized")]
    AlreadyInitialized,
}

/// Installs a `fmt` subscriber writing to stderr, filtered by `filter`
/// (e.g. `"info"` or `"idb_coordinator=debug"`).
pub fn init_logging(filter: &str) -> Result<(), LoggingError> {
    fmt()
        .with_env_filter(
            EnvFilter::try_new(filter).map_err(|e| LoggingError::InvalidFilter(e.to_string()))?,
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInitialized)
}
