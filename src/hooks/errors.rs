//! # Hook Errors

use thiserror::Error;

/// Result type returned by hooks
pub type HookResult<T> = Result<T, HookError>;

/// Failure reported by a registered hook
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HookError {
    /// The hook rejected the operation with a message
    #[error("Hook failed: {0}")]
    Failed(String),

    /// The hook task panicked or was cancelled
    #[error("Hook aborted: {0}")]
    Aborted(String),
}

impl HookError {
    /// Stable error code
    pub fn code(&self) -> &'static str {
        match self {
            HookError::Failed(_) => "HOOK_FAILED",
            HookError::Aborted(_) => "HOOK_ABORTED",
        }
    }
}
