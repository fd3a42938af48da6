//! # Filter Translation
//!
//! Rewrites portable filters, sorts, write payloads and aggregation
//! pipelines into store-native BSON. Runs only in trusted server context.

pub mod errors;
pub mod fields;
pub mod translator;

pub use errors::{FilterError, FilterResult};
pub use fields::{SOFT_DELETE_FIELD, UPDATED_AT_FIELD, CREATED_AT_FIELD};
pub use translator::{address_envelope, FilterTranslator};
