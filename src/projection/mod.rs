//! # Projection
//!
//! Field selection over result documents, plus the precomputed path trees
//! shared with pointer resolution.

pub mod engine;
pub mod errors;
pub mod path_tree;

pub use engine::{Projection, ProjectionNode};
pub use errors::{ProjectionError, ProjectionResult};
pub use path_tree::PathTree;
