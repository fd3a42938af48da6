//! # Filter Errors

use thiserror::Error;

/// Result type for filter translation
pub type FilterResult<T> = Result<T, FilterError>;

/// Errors raised while translating a portable filter or pipeline
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    /// Expression must be a map
    #[error("Filter must be a map, got {0}")]
    NotAMap(String),

    /// `$and` / `$or` / `$nor` operand is not a list of maps
    #[error("Logical operator {0} expects a list of maps")]
    InvalidLogicalGroup(String),

    /// Pipeline stage is not a single-key map
    #[error("Invalid pipeline stage: {0}")]
    InvalidStage(String),

    /// Sort direction other than 1, -1, "asc" or "desc"
    #[error("Invalid sort direction for '{0}': {1}")]
    InvalidSort(String, String),
}

impl FilterError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            FilterError::NotAMap(_) => "FILTER_NOT_A_MAP",
            FilterError::InvalidLogicalGroup(_) => "FILTER_INVALID_LOGICAL_GROUP",
            FilterError::InvalidStage(_) => "FILTER_INVALID_STAGE",
            FilterError::InvalidSort(_, _) => "FILTER_INVALID_SORT",
        }
    }
}
