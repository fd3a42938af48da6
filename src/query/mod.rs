//! # Queries
//!
//! The portable query descriptor, the client-facing builder that produces
//! it, and the server-side executor that runs it.

pub mod builder;
pub mod context;
pub mod descriptor;
pub mod errors;
pub mod executor;
pub mod naming;

pub use builder::{Payload, QueryBuilder};
pub use context::ExecutionContext;
pub use descriptor::{DocumentQuery, LiveEvent, Method, QueryOptions};
pub use errors::{ErrorBody, QueryError, QueryResult};
pub use executor::{
    ExecutorConfig, LocalTransport, QueryExecutor, QueryOutput, QueryTransport, ResultPlan,
    DEFAULT_QUERY_LIMIT,
};
pub use naming::validate_collection_name;
