//! Error types for framepacer

use thiserror::Error;

/// Result type alias using the library's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for framepacer
#[derive(Error, Debug)]
pub enum Error {
    /// Bad input rejected before any state mutation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The pacer was disconnected; every later operation fails with this.
    #[error("pacer has been disconnected")]
    Destroyed,

    /// The clock source hung up while a subscription was live.
    #[error("clock source closed")]
    ClockClosed,
}
