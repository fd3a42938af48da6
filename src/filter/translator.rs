//! Portable -> store-native translation
//!
//! For every field the translator renames through the field alias table,
//! coerces ISO-8601 strings to native datetimes and moves pointer-valued
//! fields under their `_p_` key. Empty `$and` / `$or` / `$nor` groups are
//! dropped.

use bson::{Bson, Document};
use serde_json::{Map, Value};

use super::errors::{FilterError, FilterResult};
use super::fields::{parse_iso_date, to_storage};
use crate::pointer::{alias, pointer_key, Pointer, POINTER_PREFIX};
use crate::store::codec::json_to_bson;

const LOGICAL_OPERATORS: &[&str] = &["$and", "$or", "$nor"];

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "map".to_string(),
    }
}

fn is_pointer_string(value: &Value) -> bool {
    value.as_str().is_some_and(Pointer::is_pointer)
}

/// Whether a filter value addresses a pointer: a pointer string, a list of
/// them, or an operator map whose operands are pointers.
fn is_pointer_shaped(value: &Value) -> bool {
    match value {
        Value::String(_) => is_pointer_string(value),
        Value::Array(items) => !items.is_empty() && items.iter().all(is_pointer_string),
        Value::Object(ops) => {
            !ops.is_empty()
                && ops.iter().all(|(op, operand)| match op.as_str() {
                    "$eq" | "$ne" => is_pointer_string(operand),
                    "$in" | "$nin" => operand
                        .as_array()
                        .is_some_and(|items| !items.is_empty() && items.iter().all(is_pointer_string)),
                    _ => false,
                })
        }
        _ => false,
    }
}

/// Translates portable expressions into store-native documents
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterTranslator;

impl FilterTranslator {
    /// Create a translator
    pub fn new() -> Self {
        Self
    }

    /// Translate a filter map
    pub fn translate_filter(&self, filter: &Map<String, Value>) -> FilterResult<Document> {
        self.translate_object(filter)
    }

    /// Translate a filter given as an arbitrary JSON value
    pub fn translate_filter_value(&self, filter: &Value) -> FilterResult<Document> {
        match filter {
            Value::Null => Ok(Document::new()),
            Value::Object(map) => self.translate_object(map),
            other => Err(FilterError::NotAMap(describe(other))),
        }
    }

    /// Translate a write payload. Same rewriting as filters.
    pub fn translate_document(&self, doc: &Map<String, Value>) -> FilterResult<Document> {
        self.translate_object(doc)
    }

    /// Translate an aggregation pipeline stage by stage
    pub fn translate_pipeline(&self, pipeline: &[Value]) -> FilterResult<Vec<Document>> {
        pipeline
            .iter()
            .map(|stage| match stage {
                Value::Object(map) if map.len() == 1 => self.translate_stage(map),
                other => Err(FilterError::InvalidStage(other.to_string())),
            })
            .collect()
    }

    /// Translate a sort map. Directions are 1 / -1 or "asc" / "desc".
    pub fn translate_sort(&self, sort: &Map<String, Value>) -> FilterResult<Document> {
        let mut out = Document::new();
        for (field, direction) in sort {
            let dir: i32 = match direction {
                Value::Number(n) if n.as_i64() == Some(1) => 1,
                Value::Number(n) if n.as_i64() == Some(-1) => -1,
                Value::String(s) if s.eq_ignore_ascii_case("asc") => 1,
                Value::String(s) if s.eq_ignore_ascii_case("desc") => -1,
                other => return Err(FilterError::InvalidSort(field.clone(), other.to_string())),
            };
            out.insert(to_storage(field).into_owned(), dir);
        }
        Ok(out)
    }

    fn translate_stage(&self, stage: &Map<String, Value>) -> FilterResult<Document> {
        let mut out = self.translate_object(stage)?;
        if let Ok(lookup) = out.get_document_mut("$lookup") {
            if let Some(Bson::String(from)) = lookup.get("from") {
                let internal = alias::to_internal(from).to_string();
                lookup.insert("from", internal);
            }
        }
        Ok(out)
    }

    fn translate_object(&self, map: &Map<String, Value>) -> FilterResult<Document> {
        let mut out = Document::new();
        for (key, value) in map {
            if LOGICAL_OPERATORS.contains(&key.as_str()) {
                let group = self.translate_group(key, value)?;
                if !group.is_empty() {
                    out.insert(key.clone(), group);
                }
            } else if key.starts_with('$') {
                out.insert(key.clone(), self.translate_value(value)?);
            } else {
                let storage = to_storage(key);
                let storage = if !storage.starts_with(POINTER_PREFIX) && is_pointer_shaped(value) {
                    pointer_key(&storage)
                } else {
                    storage.into_owned()
                };
                out.insert(storage, self.translate_value(value)?);
            }
        }
        Ok(out)
    }

    fn translate_group(&self, operator: &str, value: &Value) -> FilterResult<Vec<Bson>> {
        let Value::Array(items) = value else {
            return Err(FilterError::InvalidLogicalGroup(operator.to_string()));
        };
        items
            .iter()
            .map(|item| match item {
                Value::Object(map) => self.translate_object(map).map(Bson::Document),
                _ => Err(FilterError::InvalidLogicalGroup(operator.to_string())),
            })
            .collect()
    }

    fn translate_value(&self, value: &Value) -> FilterResult<Bson> {
        Ok(match value {
            Value::String(s) => match parse_iso_date(s) {
                Some(dt) => Bson::DateTime(dt),
                None => Bson::String(s.clone()),
            },
            Value::Array(items) => Bson::Array(
                items
                    .iter()
                    .map(|item| self.translate_value(item))
                    .collect::<FilterResult<_>>()?,
            ),
            Value::Object(map) => Bson::Document(self.translate_object(map)?),
            other => json_to_bson(other),
        })
    }
}

/// Prefix every field of a store-native filter so it addresses the document
/// nested inside a change envelope (`prefix` is usually `fullDocument`).
pub fn address_envelope(filter: &Document, prefix: &str) -> Document {
    let mut out = Document::new();
    for (key, value) in filter {
        if LOGICAL_OPERATORS.contains(&key.as_str()) {
            let group = match value {
                Bson::Array(items) => items
                    .iter()
                    .map(|item| match item {
                        Bson::Document(doc) => Bson::Document(address_envelope(doc, prefix)),
                        other => other.clone(),
                    })
                    .collect(),
                other => vec![other.clone()],
            };
            out.insert(key.clone(), group);
        } else if key.starts_with('$') {
            out.insert(key.clone(), value.clone());
        } else {
            out.insert(format!("{}.{}", prefix, key), value.clone());
        }
    }
    out
}
