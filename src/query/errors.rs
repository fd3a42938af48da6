//! # Query Errors
//!
//! Every failure a query can produce, from build-time validation through
//! store failures. Synchronous callers see them as [`ErrorBody`] values.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::descriptor::Method;
use crate::filter::FilterError;
use crate::hooks::HookError;
use crate::pointer::PointerError;
use crate::projection::ProjectionError;
use crate::store::StoreError;

/// Result type for query operations
pub type QueryResult<T> = Result<T, QueryError>;

/// Query errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum QueryError {
    // ==================
    // Build-time validation
    // ==================
    /// Collection name is not TitleCase
    #[error("Collection name '{0}' must be TitleCase")]
    CollectionCasing(String),

    /// Collection name is plural
    #[error("Collection name '{0}' must be singular")]
    CollectionPlural(String),

    /// Mutation without a filter
    #[error("{0} requires a non-empty filter")]
    MissingFilter(Method),

    /// Pipeline on a method other than aggregate
    #[error("Pipeline is only allowed with aggregate, not {0}")]
    PipelineNotAllowed(Method),

    /// Elevated mode requested outside server context
    #[error("unlock is only available in server context")]
    UnlockNotAllowed,

    /// Write without a document
    #[error("{0} requires a document payload")]
    MissingDocument(Method),

    /// By-id fetch without an id
    #[error("{0} requires an object id")]
    MissingObjectId(Method),

    /// Method missing from a descriptor
    #[error("Query method is required")]
    MissingMethod,

    /// Malformed filter, sort or pipeline
    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    /// Malformed projection
    #[error("{0}")]
    Projection(#[from] ProjectionError),

    // ==================
    // Authorization
    // ==================
    /// Reserved collection without elevated mode
    #[error("Collection '{0}' requires unlock")]
    Unauthorized(String),

    // ==================
    // Execution
    // ==================
    /// No document matched a single-document update or delete
    #[error("No {0} document matched")]
    NotFound(String),

    /// Store failure
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Before hook failure
    #[error("{0}")]
    Hook(#[from] HookError),

    /// Pointer decoding or target fetch failure
    #[error("{0}")]
    Pointer(#[from] PointerError),

    /// Transport failure between builder and executor
    #[error("Transport error: {0}")]
    Transport(String),
}

impl From<FilterError> for QueryError {
    fn from(e: FilterError) -> Self {
        QueryError::InvalidQuery(e.to_string())
    }
}

impl QueryError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            QueryError::CollectionCasing(_) => "COLLECTION_CASING",
            QueryError::CollectionPlural(_) => "COLLECTION_PLURAL",
            QueryError::MissingFilter(_) => "MISSING_FILTER",
            QueryError::PipelineNotAllowed(_) => "PIPELINE_NOT_ALLOWED",
            QueryError::UnlockNotAllowed => "UNLOCK_NOT_ALLOWED",
            QueryError::MissingDocument(_) => "MISSING_DOCUMENT",
            QueryError::MissingObjectId(_) => "MISSING_OBJECT_ID",
            QueryError::MissingMethod => "MISSING_METHOD",
            QueryError::InvalidQuery(_) => "INVALID_QUERY",
            QueryError::Projection(e) => e.code(),
            QueryError::Unauthorized(_) => "UNAUTHORIZED",
            QueryError::NotFound(_) => "NOT_FOUND",
            QueryError::Store(e) => e.code(),
            QueryError::Hook(e) => e.code(),
            QueryError::Pointer(e) => e.code(),
            QueryError::Transport(_) => "TRANSPORT",
        }
    }

    /// Whether the error was raised before any I/O
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            QueryError::CollectionCasing(_)
                | QueryError::CollectionPlural(_)
                | QueryError::MissingFilter(_)
                | QueryError::PipelineNotAllowed(_)
                | QueryError::UnlockNotAllowed
                | QueryError::MissingDocument(_)
                | QueryError::MissingObjectId(_)
                | QueryError::MissingMethod
                | QueryError::InvalidQuery(_)
                | QueryError::Projection(_)
        )
    }

    /// Structured form for callers
    pub fn to_body(&self) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
        }
    }
}

/// `{code, message}` error value
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&QueryError> for ErrorBody {
    fn from(e: &QueryError) -> Self {
        e.to_body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body() {
        let body = QueryError::MissingFilter(Method::Update).to_body();
        assert_eq!(body.code, "MISSING_FILTER");
        assert_eq!(body.message, "update requires a non-empty filter");
    }

    #[test]
    fn test_nested_codes_pass_through() {
        let err: QueryError = StoreError::Connection("down".into()).into();
        assert_eq!(err.code(), "STORE_CONNECTION");
        assert!(!err.is_validation());
        assert!(QueryError::UnlockNotAllowed.is_validation());
    }
}
