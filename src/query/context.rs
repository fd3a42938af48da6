//! Execution context: where a query is built and sent from.

use serde::{Deserialize, Serialize};

/// Trust level of the code issuing a query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    /// Trusted server code; elevated mode allowed
    Server,
    /// Untrusted client code
    #[default]
    Client,
}

impl ExecutionContext {
    /// Whether elevated mode may be requested
    pub fn is_server(&self) -> bool {
        matches!(self, ExecutionContext::Server)
    }
}
