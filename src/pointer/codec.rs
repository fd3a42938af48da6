//! Pointer wire format: `"{ExternalCollectionName}${objectId}"`.

use std::fmt;

use rand::distributions::Alphanumeric;
use rand::Rng;

use super::alias;
use super::errors::{PointerError, PointerResult};

/// Key prefix marking a stored field as holding a pointer
pub const POINTER_PREFIX: &str = "_p_";

/// Length of every object id
pub const OBJECT_ID_LEN: usize = 10;

const SEPARATOR: char = '$';

/// A decoded reference to a document in another collection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pointer {
    /// External collection name
    pub collection: String,
    /// Target object id
    pub object_id: String,
}

impl Pointer {
    /// Create a pointer; internal collection names are normalized to external ones
    pub fn new(collection: impl AsRef<str>, object_id: impl Into<String>) -> Self {
        Self {
            collection: alias::to_external(collection.as_ref()).to_string(),
            object_id: object_id.into(),
        }
    }

    /// Encode to the wire string
    pub fn encode(&self) -> String {
        format!(
            "{}{}{}",
            alias::to_external(&self.collection),
            SEPARATOR,
            self.object_id
        )
    }

    /// Decode a wire string
    pub fn decode(raw: &str) -> PointerResult<Self> {
        if raw.matches(SEPARATOR).count() != 1 {
            return Err(PointerError::Separator(raw.to_string()));
        }

        let (collection, object_id) = raw
            .split_once(SEPARATOR)
            .ok_or_else(|| PointerError::Separator(raw.to_string()))?;

        if collection.is_empty() {
            return Err(PointerError::EmptyCollection(raw.to_string()));
        }

        if object_id.chars().count() != OBJECT_ID_LEN {
            return Err(PointerError::ObjectIdLength(raw.to_string(), OBJECT_ID_LEN));
        }

        Ok(Self::new(collection, object_id))
    }

    /// Whether a string has the pointer shape
    pub fn is_pointer(raw: &str) -> bool {
        Self::decode(raw).is_ok()
    }

    /// Decode a JSON value if it is a pointer string
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value.as_str().and_then(|s| Self::decode(s).ok())
    }

    /// Storage collection name of the target
    pub fn internal_collection(&self) -> &str {
        alias::to_internal(&self.collection)
    }
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Storage key for a pointer-valued field
pub fn pointer_key(field: &str) -> String {
    if field.starts_with(POINTER_PREFIX) {
        field.to_string()
    } else {
        format!("{}{}", POINTER_PREFIX, field)
    }
}

/// Field name behind a pointer-prefixed key
pub fn strip_pointer_key(key: &str) -> Option<&str> {
    key.strip_prefix(POINTER_PREFIX)
}

/// Generate a fresh object id
pub fn new_object_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(OBJECT_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for collection in ["User", "Post", "Session"] {
            let id = new_object_id();
            let encoded = Pointer::new(collection, id.clone()).encode();
            assert_eq!(encoded.matches('$').count(), 1);

            let decoded = Pointer::decode(&encoded).unwrap();
            assert_eq!(decoded.collection, collection);
            assert_eq!(decoded.object_id, id);
        }
    }

    #[test]
    fn test_internal_name_is_externalized() {
        let pointer = Pointer::new("_User", "abcdefghij");
        assert_eq!(pointer.encode(), "User$abcdefghij");
        assert_eq!(pointer.internal_collection(), "_User");

        let decoded = Pointer::decode("_User$abcdefghij").unwrap();
        assert_eq!(decoded.collection, "User");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(matches!(
            Pointer::decode("User"),
            Err(PointerError::Separator(_))
        ));
        assert!(matches!(
            Pointer::decode("User$abc$defghij"),
            Err(PointerError::Separator(_))
        ));
        assert!(matches!(
            Pointer::decode("$abcdefghij"),
            Err(PointerError::EmptyCollection(_))
        ));
        assert!(matches!(
            Pointer::decode("User$short"),
            Err(PointerError::ObjectIdLength(_, 10))
        ));
    }

    #[test]
    fn test_object_id_shape() {
        let id = new_object_id();
        assert_eq!(id.len(), OBJECT_ID_LEN);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_pointer_key() {
        assert_eq!(pointer_key("author"), "_p_author");
        assert_eq!(pointer_key("_p_author"), "_p_author");
        assert_eq!(strip_pointer_key("_p_author"), Some("author"));
        assert_eq!(strip_pointer_key("author"), None);
    }
}
