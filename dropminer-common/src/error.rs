// ================================================================
// File: dropminer-common/src/error.rs
// ================================================================

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Not found error: {0}")]
    NotFound(String),

    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    #[error("Not logged in")]
    Unauthenticated,

    #[error("Device login expired before it was authorized")]
    LoginExpired,

    #[error("Device login was denied")]
    LoginDenied,

    #[error("Invalid data: {0}")]
    Invalid(String),

    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Manual action required: {0}")]
    ManualActionRequired(String),

    #[error("Event stream pool exhausted: {0}")]
    PoolExhausted(String),

    #[error("Fatal error: {0}")]
    Fatal(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Key derivation error: {0}")]
    KeyDerivation(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Decryption error: {0}")]
    Decryption(String),

    #[error("Keyring error: {0}")]
    Keyring(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("Task error: {0}")]
    Task(String),

    #[error("Engine stopped")]
    Stopped,
}

/// Coarse classification the engine uses to pick a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    AuthExpired,
    RateLimited,
    Transient,
    NotFound,
    Invalid,
    ManualActionRequired,
    PoolExhausted,
    Fatal,
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::AuthExpired(_) | Error::Unauthenticated => ErrorKind::AuthExpired,
            Error::Transient(_) | Error::WebSocket(_) | Error::Timeout(_) => ErrorKind::Transient,
            Error::Http(e) => {
                if e.status().is_some_and(|s| s.is_client_error()) {
                    ErrorKind::Fatal
                } else {
                    ErrorKind::Transient
                }
            }
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Invalid(_) | Error::Json(_) | Error::Parse(_) => ErrorKind::Invalid,
            Error::ManualActionRequired(_) => ErrorKind::ManualActionRequired,
            Error::PoolExhausted(_) => ErrorKind::PoolExhausted,
            _ => ErrorKind::Fatal,
        }
    }

    /// Only transient failures and rate limits are retried locally.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::RateLimited)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self.kind(), ErrorKind::Fatal | ErrorKind::ManualActionRequired)
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Fatal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Fatal(s.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Fatal(e.to_string())
    }
}

impl From<keyring::Error> for Error {
    fn from(e: keyring::Error) -> Self {
        Error::Keyring(e.to_string())
    }
}
