//! # Pointer Errors

use thiserror::Error;

/// Result type for pointer operations
pub type PointerResult<T> = Result<T, PointerError>;

/// Pointer decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PointerError {
    /// The raw string does not contain exactly one `$`
    #[error("Malformed pointer '{0}': expected exactly one '$'")]
    Separator(String),

    /// Collection segment is empty
    #[error("Malformed pointer '{0}': empty collection name")]
    EmptyCollection(String),

    /// Object id segment has the wrong length
    #[error("Malformed pointer '{0}': object id must be {1} characters")]
    ObjectIdLength(String, usize),

    /// Fetching the target document failed
    #[error("Failed to fetch pointer target {0}: {1}")]
    Source(String, String),
}

impl PointerError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            PointerError::Separator(_) => "POINTER_SEPARATOR",
            PointerError::EmptyCollection(_) => "POINTER_EMPTY_COLLECTION",
            PointerError::ObjectIdLength(_, _) => "POINTER_OBJECT_ID_LENGTH",
            PointerError::Source(_, _) => "POINTER_SOURCE",
        }
    }
}
