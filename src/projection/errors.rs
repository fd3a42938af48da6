//! # Projection Errors

use thiserror::Error;

/// Result type for projection parsing
pub type ProjectionResult<T> = Result<T, ProjectionError>;

/// Projection parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProjectionError {
    /// Inclusion and exclusion values in one projection
    #[error("Projection cannot mix inclusion and exclusion")]
    Mixed,

    /// Value other than 0, 1, or a nested map
    #[error("Invalid projection value for '{0}': {1}")]
    InvalidValue(String, String),

    /// Projection is not a map
    #[error("Projection must be a map, got {0}")]
    NotAMap(String),
}

impl ProjectionError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            ProjectionError::Mixed => "PROJECTION_MIXED",
            ProjectionError::InvalidValue(_, _) => "PROJECTION_INVALID_VALUE",
            ProjectionError::NotAMap(_) => "PROJECTION_NOT_A_MAP",
        }
    }
}
