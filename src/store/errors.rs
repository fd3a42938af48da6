//! # Store Errors

use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by a document store backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// Backend unreachable
    #[error("Connection error: {0}")]
    Connection(String),

    /// Write was not acknowledged
    #[error("Write not acknowledged: {0}")]
    WriteNotAcknowledged(String),

    /// Operation failed in the backend
    #[error("Backend error: {0}")]
    Backend(String),

    /// Change feed failed
    #[error("Change feed error: {0}")]
    Feed(String),

    /// Stored data could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),
}

impl StoreError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::Connection(_) => "STORE_CONNECTION",
            StoreError::WriteNotAcknowledged(_) => "STORE_WRITE_NOT_ACKNOWLEDGED",
            StoreError::Backend(_) => "STORE_BACKEND",
            StoreError::Feed(_) => "STORE_FEED",
            StoreError::Decode(_) => "STORE_DECODE",
        }
    }
}

impl From<mongodb::error::Error> for StoreError {
    fn from(e: mongodb::error::Error) -> Self {
        match e.kind.as_ref() {
            mongodb::error::ErrorKind::ServerSelection { .. }
            | mongodb::error::ErrorKind::Io(_)
            | mongodb::error::ErrorKind::ConnectionPoolCleared { .. } => {
                StoreError::Connection(e.to_string())
            }
            _ => StoreError::Backend(e.to_string()),
        }
    }
}
