//! Error types for the secure_transfer crate.

use thiserror::Error;

/// Errors that can occur while authenticating or moving files.
#[derive(Error, Debug)]
pub enum TransferError {
    /// Invalid credentials, an expired registration key, or a flow that is
    /// not allowed for the requested operation.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server rejected a cached token.
    #[error("Login session expired: {0}")]
    SessionExpired(String),

    /// Transport failure or a transient server status.
    #[error("Network error: {0}")]
    Network(String),

    /// The server rejected chunk ordering or size, or local and remote state disagree.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Missing or invalid local registration.
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Prompt failed: {0}")]
    Prompt(String),

    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("No files matched pattern: {0}")]
    NoFilesMatched(String),

    #[error("Invalid project identifier: {0}")]
    InvalidProject(String),
}

impl TransferError {
    /// Only network failures may be retried, and only by re-invoking the
    /// command with the same upload id.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Network(_))
    }
}

impl From<reqwest::Error> for TransferError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            return TransferError::Protocol(format!("malformed response: {}", err));
        }
        match err.status() {
            Some(status) => TransferError::Api {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => TransferError::Network(err.to_string()),
        }
    }
}

/// Result type alias for TransferError.
pub type Result<T> = std::result::Result<T, TransferError>;
