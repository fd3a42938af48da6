//! BSON <-> JSON conversion.
//!
//! Portable documents are plain JSON. Store-native datetimes surface as
//! ISO-8601 strings with millisecond precision, object ids as hex strings.

use bson::{Bson, Document};
use chrono::SecondsFormat;
use serde_json::{Map, Number, Value};

/// Render a BSON datetime the way portable documents carry it
pub fn format_datetime(dt: bson::DateTime) -> String {
    dt.to_chrono().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Convert a BSON value to JSON
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => Number::from_f64(*f).map(Value::Number).unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s.clone()),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => document_to_json(doc),
        Bson::DateTime(dt) => Value::String(format_datetime(*dt)),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        other => other.clone().into_relaxed_extjson(),
    }
}

/// Convert a BSON document to a JSON object
pub fn document_to_json(doc: &Document) -> Value {
    let mut out = Map::with_capacity(doc.len());
    for (key, value) in doc {
        out.insert(key.clone(), bson_to_json(value));
    }
    Value::Object(out)
}

/// Convert a JSON value to BSON without any coercion
pub fn json_to_bson(value: &Value) -> Bson {
    match value {
        Value::Null => Bson::Null,
        Value::Bool(b) => Bson::Boolean(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Bson::Int64(i)
            } else {
                Bson::Double(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => Bson::String(s.clone()),
        Value::Array(items) => Bson::Array(items.iter().map(json_to_bson).collect()),
        Value::Object(map) => Bson::Document(map_to_document(map)),
    }
}

/// Convert a JSON object to a BSON document without any coercion
pub fn map_to_document(map: &Map<String, Value>) -> Document {
    let mut doc = Document::new();
    for (key, value) in map {
        doc.insert(key.clone(), json_to_bson(value));
    }
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use serde_json::json;

    #[test]
    fn test_datetime_renders_iso() {
        let dt = bson::DateTime::from_millis(1_704_067_200_000);
        assert_eq!(bson_to_json(&Bson::DateTime(dt)), json!("2024-01-01T00:00:00.000Z"));
    }

    #[test]
    fn test_document_conversion() {
        let doc = doc! {"a": 1_i32, "b": [true, "x"], "c": {"d": 2.5}};
        assert_eq!(
            document_to_json(&doc),
            json!({"a": 1, "b": [true, "x"], "c": {"d": 2.5}})
        );
    }

    #[test]
    fn test_json_numbers() {
        assert_eq!(json_to_bson(&json!(3)), Bson::Int64(3));
        assert_eq!(json_to_bson(&json!(1.5)), Bson::Double(1.5));
    }
}
