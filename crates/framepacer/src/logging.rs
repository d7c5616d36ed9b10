//! Structured logging setup for framepacer hosts.
//!
//! Thin wrapper over `tracing-subscriber`: an env-filterable level, pretty
//! or JSON output, and a guard against double initialization. Library code
//! only ever emits through `tracing` macros; hosts decide whether and how to
//! install a subscriber.

use std::sync::OnceLock;

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

/// Global flag to track if logging has been initialized
static LOGGING_INITIALIZED: OnceLock<bool> = OnceLock::new();

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level filter (trace, debug, info, warn, error).
    /// Can be overridden by the RUST_LOG environment variable.
    pub level: String,
    /// Emit machine-parseable JSON lines instead of pretty output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Error type for logging initialization
#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("logging already initialized")]
    AlreadyInitialized,

    #[error("invalid log level: {0}")]
    InvalidLevel(String),

    #[error("failed to set global subscriber: {0}")]
    SetSubscriber(String),
}

/// Initialize the global tracing subscriber once.
///
/// # Errors
///
/// `AlreadyInitialized` on a second call, `InvalidLevel` if the configured
/// level does not parse, `SetSubscriber` if another subscriber was installed
/// out-of-band.
pub fn init_logging(config: &LogConfig) -> Result<(), LogError> {
    if LOGGING_INITIALIZED.get().is_some() {
        return Err(LogError::AlreadyInitialized);
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|_| LogError::InvalidLevel(config.level.clone()))?;

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    result.map_err(|e| LogError::SetSubscriber(e.to_string()))?;

    let _ = LOGGING_INITIALIZED.set(true);
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
