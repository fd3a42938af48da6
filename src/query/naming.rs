//! Collection naming convention: singular TitleCase (`User`, `BlogPost`).
//! Checked when a builder is created, before any I/O.

use super::errors::{QueryError, QueryResult};

/// Validate an external collection name
pub fn validate_collection_name(name: &str) -> QueryResult<()> {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return Err(QueryError::CollectionCasing(name.to_string()));
    };

    if !first.is_ascii_uppercase() || !chars.all(|c| c.is_ascii_alphanumeric()) {
        return Err(QueryError::CollectionCasing(name.to_string()));
    }

    if name.ends_with('s') {
        return Err(QueryError::CollectionPlural(name.to_string()));
    }

    Ok(())
}
