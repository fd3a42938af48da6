//! Field naming conventions shared by reads, writes and the live feed.
//!
//! Portable documents address system fields by their public names
//! (`objectId`, `createdAt`, ...). Storage uses underscore-prefixed names.

use std::borrow::Cow;
use std::sync::OnceLock;

use bson::Document;
use chrono::DateTime;
use regex::Regex;
use serde_json::{Map, Value};

use crate::pointer::codec::strip_pointer_key;
use crate::store::codec::bson_to_json;

/// Storage name of the object id
pub const ID_FIELD: &str = "_id";

/// Storage name of the creation timestamp
pub const CREATED_AT_FIELD: &str = "_created_at";

/// Storage name of the last-update timestamp
pub const UPDATED_AT_FIELD: &str = "_updated_at";

/// Soft-delete marker. A document carrying it is deleted.
pub const SOFT_DELETE_FIELD: &str = "_expires_at";

/// (portable, storage) pairs
const FIELD_ALIASES: &[(&str, &str)] = &[
    ("objectId", ID_FIELD),
    ("createdAt", CREATED_AT_FIELD),
    ("updatedAt", UPDATED_AT_FIELD),
    ("expiresAt", SOFT_DELETE_FIELD),
];

const ISO_DATE_PATTERN: &str =
    r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d{1,9})?(Z|[+-]\d{2}:\d{2})$";

fn iso_date_regex() -> Option<&'static Regex> {
    static ISO_DATE: OnceLock<Option<Regex>> = OnceLock::new();
    ISO_DATE
        .get_or_init(|| Regex::new(ISO_DATE_PATTERN).ok())
        .as_ref()
}

/// Storage name of a portable field. Only the first segment of a dotted
/// path is aliased.
pub fn to_storage(field: &str) -> Cow<'_, str> {
    let (head, rest) = match field.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (field, None),
    };

    let Some((_, storage)) = FIELD_ALIASES.iter().find(|(portable, _)| *portable == head) else {
        return Cow::Borrowed(field);
    };

    match rest {
        Some(rest) => Cow::Owned(format!("{}.{}", storage, rest)),
        None => Cow::Borrowed(*storage),
    }
}

/// Portable name of a storage field
pub fn to_portable(field: &str) -> &str {
    FIELD_ALIASES
        .iter()
        .find(|(_, storage)| *storage == field)
        .map(|(portable, _)| *portable)
        .unwrap_or(field)
}

/// Parse an ISO-8601 timestamp into the store's datetime type
pub fn parse_iso_date(raw: &str) -> Option<bson::DateTime> {
    if !iso_date_regex()?.is_match(raw) {
        return None;
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| bson::DateTime::from_chrono(dt.with_timezone(&chrono::Utc)))
}

/// Convert a stored document into a portable JSON object.
/// Top-level system fields are renamed; nothing is stripped.
pub fn portable_document(doc: &Document) -> Value {
    let mut out = Map::with_capacity(doc.len());
    for (key, value) in doc {
        out.insert(to_portable(key).to_string(), bson_to_json(value));
    }
    Value::Object(out)
}

/// Prepare a portable document for a caller: unresolved `_p_<field>` keys
/// become `<field>` pointer strings and remaining internal fields are
/// dropped.
pub fn finalize(value: &mut Value) {
    let Value::Object(obj) = value else {
        return;
    };

    let internal: Vec<String> = obj.keys().filter(|k| k.starts_with('_')).cloned().collect();
    for key in internal {
        let Some(raw) = obj.remove(&key) else {
            continue;
        };
        if let Some(field) = strip_pointer_key(&key) {
            if !field.is_empty() && !obj.contains_key(field) {
                obj.insert(field.to_string(), raw);
            }
        }
    }
}
