//! # Live Query Errors
//!
//! Error types for live queries and the close reasons that end a
//! subscription socket.

use thiserror::Error;

use crate::query::QueryError;
use crate::store::StoreError;

/// Result type for live-query operations
pub type LiveQueryResult<T> = Result<T, LiveQueryError>;

/// WebSocket close code for application-level rejections
pub const POLICY_VIOLATION: u16 = 1008;

/// Reason string carried by a policy-violation close frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    InvalidSecret,
    InvalidSession,
    CollectionNotAllowed,
    InvalidQueryMethod,
    /// Handshake body could not be parsed
    InvalidQuery,
    /// Feed ended or failed; the client may reconnect
    StreamClosed,
    /// Any other policy-violation reason
    PolicyViolation(String),
}

impl CloseReason {
    /// Reason string on the wire
    pub fn as_str(&self) -> &str {
        match self {
            CloseReason::InvalidSecret => "Invalid secret",
            CloseReason::InvalidSession => "Invalid session",
            CloseReason::CollectionNotAllowed => "Collection not allowed",
            CloseReason::InvalidQueryMethod => "Invalid query method",
            CloseReason::InvalidQuery => "Invalid query",
            CloseReason::StreamClosed => "stream closed",
            CloseReason::PolicyViolation(reason) => reason,
        }
    }

    /// Parse a close frame. Unknown reasons only count when the code is a
    /// policy violation; other closes are ordinary disconnects.
    pub fn from_close(code: u16, reason: &str) -> Option<Self> {
        let parsed = match reason {
            "Invalid secret" => CloseReason::InvalidSecret,
            "Invalid session" => CloseReason::InvalidSession,
            "Collection not allowed" => CloseReason::CollectionNotAllowed,
            "Invalid query method" => CloseReason::InvalidQueryMethod,
            "Invalid query" => CloseReason::InvalidQuery,
            "stream closed" => CloseReason::StreamClosed,
            other if code == POLICY_VIOLATION => CloseReason::PolicyViolation(other.to_string()),
            _ => return None,
        };
        Some(parsed)
    }

    /// Whether the client must stop reconnecting
    pub fn is_terminal(&self) -> bool {
        !matches!(self, CloseReason::StreamClosed)
    }

    /// Close code sent with this reason
    pub fn close_code(&self) -> u16 {
        POLICY_VIOLATION
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live-query errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LiveQueryError {
    // ==================
    // Connection Errors
    // ==================
    /// Server closed the subscription with a terminal reason
    #[error("Subscription rejected: {0}")]
    Rejected(CloseReason),

    /// Socket closed without a terminal reason
    #[error("Connection closed: {0}")]
    Disconnected(String),

    /// WebSocket upgrade never completed
    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    /// Transport failure
    #[error("Connection error: {0}")]
    Connection(String),

    /// Malformed frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Error frame sent by the server
    #[error("Stream error: {0}")]
    Stream(String),

    // ==================
    // Server Errors
    // ==================
    /// Listener could not be bound
    #[error("Failed to bind {0}: {1}")]
    Bind(String, String),

    /// Invalid descriptor
    #[error("{0}")]
    Query(#[from] QueryError),

    /// Change feed failure
    #[error("{0}")]
    Store(#[from] StoreError),
}

impl LiveQueryError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            LiveQueryError::Rejected(_) => "LIVE_REJECTED",
            LiveQueryError::Disconnected(_) => "LIVE_DISCONNECTED",
            LiveQueryError::HandshakeFailed(_) => "LIVE_HANDSHAKE",
            LiveQueryError::Connection(_) => "LIVE_CONNECTION",
            LiveQueryError::Protocol(_) => "LIVE_PROTOCOL",
            LiveQueryError::Stream(_) => "LIVE_STREAM",
            LiveQueryError::Bind(_, _) => "LIVE_BIND",
            LiveQueryError::Query(e) => e.code(),
            LiveQueryError::Store(e) => e.code(),
        }
    }

    /// Whether a subscription ends for good on this error
    pub fn is_terminal(&self) -> bool {
        match self {
            LiveQueryError::Rejected(reason) => reason.is_terminal(),
            LiveQueryError::HandshakeFailed(_)
            | LiveQueryError::Bind(_, _)
            | LiveQueryError::Query(_) => true,
            _ => false,
        }
    }
}
