//! Internal <-> external collection names.
//!
//! System collections are stored under an underscore-prefixed name while
//! clients address them by their plain TitleCase name.

/// (external, internal) pairs
const COLLECTION_ALIASES: &[(&str, &str)] = &[
    ("User", "_User"),
    ("Session", "_Session"),
    ("Password", "_Password"),
];

/// Map an external collection name to its storage name
pub fn to_internal(external: &str) -> &str {
    COLLECTION_ALIASES
        .iter()
        .find(|(ext, _)| *ext == external)
        .map(|(_, int)| *int)
        .unwrap_or(external)
}

/// Map a storage collection name to its external name
pub fn to_external(internal: &str) -> &str {
    COLLECTION_ALIASES
        .iter()
        .find(|(_, int)| *int == internal)
        .map(|(ext, _)| *ext)
        .unwrap_or(internal)
}
