//! Error types for the conviction engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Telemetry errors
    #[error("Unknown token: {0}")]
    UnknownToken(String),

    #[error("Telemetry feed error: {0}")]
    Feed(String),

    // Execution errors
    #[error("Execution timed out after {0}ms")]
    ExecutionTimeout(u64),

    #[error("Execution transport failure: {0}")]
    ExecutionTransport(String),

    #[error("Execution rejected: {0}")]
    ExecutionRejected(String),

    #[error("Exit for position {position} failed after {attempts} attempts: {last_error}")]
    ExitEscalated {
        position: String,
        attempts: u32,
        last_error: String,
    },

    // Position errors
    #[error("Invariant violation for {token}: {detail}")]
    InvariantViolation { token: String, detail: String },

    // Ledger errors
    #[error("Ledger journal failure: {0}")]
    Ledger(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ExecutionTimeout(_) | Error::ExecutionTransport(_)
        )
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Feed(e.to_string())
    }
}
