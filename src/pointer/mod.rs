//! # Pointers
//!
//! Cross-collection references encoded as `"{Collection}${objectId}"`
//! strings, and the resolver that joins them into embedded documents.

pub mod alias;
pub mod codec;
pub mod errors;
pub mod resolver;

pub use codec::{new_object_id, pointer_key, Pointer, OBJECT_ID_LEN, POINTER_PREFIX};
pub use errors::{PointerError, PointerResult};
pub use resolver::{DocumentSource, PointerResolver};
