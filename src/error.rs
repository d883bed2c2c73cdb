//! Error types for the fingate service.

use thiserror::Error;

/// Main error type for fingate operations.
///
/// Rejecting a request is not an error: the gate returns a
/// [`Decision`](crate::ratelimit::Decision) for that.
#[derive(Error, Debug)]
pub enum FinGateError {
    /// Invalid configuration values
    #[error("Configuration error: {0}")]
    Config(String),

    /// Failure while reading or merging configuration sources
    #[error("Configuration source error: {0}")]
    ConfigSource(#[from] config::ConfigError),

    /// The background sweep kept panicking and was stopped
    #[error("Reaper stopped after {consecutive_failures} consecutive sweep failures")]
    ReaperFailed { consecutive_failures: u32 },

    /// A background task could not be joined
    #[error("Background task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for fingate operations.
pub type Result<T> = std::result::Result<T, FinGateError>;
