//! Projection engine
//!
//! A projection is either pure inclusion (values `1`) or pure exclusion
//! (values `0`). Nested maps recurse into sub-documents and arrays of
//! sub-documents.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use super::errors::{ProjectionError, ProjectionResult};

/// One entry of a projection map
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProjectionNode {
    /// Keep the field
    Include,
    /// Drop the field
    Exclude,
    /// Recurse into the field
    Nested(Projection),
}

/// Parsed projection map
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Projection {
    fields: BTreeMap<String, ProjectionNode>,
}

#[derive(Default)]
struct LeafCount {
    include: usize,
    exclude: usize,
}

impl Projection {
    /// Parse a projection from its JSON map form
    pub fn from_map(map: &Map<String, Value>) -> ProjectionResult<Self> {
        let projection = Self::parse(map)?;

        let mut count = LeafCount::default();
        projection.count_leaves(&mut count);
        if count.include > 0 && count.exclude > 0 {
            return Err(ProjectionError::Mixed);
        }

        Ok(projection)
    }

    /// Parse a projection from a JSON value (must be an object)
    pub fn from_value(value: &Value) -> ProjectionResult<Self> {
        match value {
            Value::Object(map) => Self::from_map(map),
            Value::Null => Ok(Self::default()),
            other => Err(ProjectionError::NotAMap(other.to_string())),
        }
    }

    fn parse(map: &Map<String, Value>) -> ProjectionResult<Self> {
        let mut fields = BTreeMap::new();
        for (key, value) in map {
            let node = match value {
                Value::Bool(true) => ProjectionNode::Include,
                Value::Bool(false) => ProjectionNode::Exclude,
                Value::Number(n) => match n.as_i64() {
                    Some(1) => ProjectionNode::Include,
                    Some(0) => ProjectionNode::Exclude,
                    _ => return Err(ProjectionError::InvalidValue(key.clone(), value.to_string())),
                },
                Value::Object(sub) => ProjectionNode::Nested(Self::parse(sub)?),
                _ => return Err(ProjectionError::InvalidValue(key.clone(), value.to_string())),
            };
            fields.insert(key.clone(), node);
        }
        Ok(Self { fields })
    }

    fn count_leaves(&self, count: &mut LeafCount) {
        for node in self.fields.values() {
            match node {
                ProjectionNode::Include => count.include += 1,
                ProjectionNode::Exclude => count.exclude += 1,
                ProjectionNode::Nested(sub) => sub.count_leaves(count),
            }
        }
    }

    /// Whether the projection selects nothing (pass-through)
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// True when every leaf is an exclusion
    pub fn is_exclusion(&self) -> bool {
        let mut count = LeafCount::default();
        self.count_leaves(&mut count);
        count.include == 0
    }

    /// Apply to a document or array of documents
    pub fn apply(&self, value: &Value) -> Value {
        if self.is_empty() {
            return value.clone();
        }
        if self.is_exclusion() {
            self.exclude(value)
        } else {
            match value {
                Value::Object(_) | Value::Array(_) => {
                    self.include(value).unwrap_or_else(|| Value::Object(Map::new()))
                }
                other => other.clone(),
            }
        }
    }

    fn exclude(&self, value: &Value) -> Value {
        match value {
            Value::Object(obj) => {
                let mut out = Map::with_capacity(obj.len());
                for (key, field) in obj {
                    match self.fields.get(key) {
                        Some(ProjectionNode::Exclude) => {}
                        Some(ProjectionNode::Nested(sub)) => {
                            out.insert(key.clone(), sub.exclude(field));
                        }
                        _ => {
                            out.insert(key.clone(), field.clone());
                        }
                    }
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|i| self.exclude(i)).collect()),
            other => other.clone(),
        }
    }

    fn include(&self, value: &Value) -> Option<Value> {
        match value {
            Value::Object(obj) => {
                let mut out = Map::new();
                for (key, node) in &self.fields {
                    let Some(field) = obj.get(key) else {
                        continue;
                    };
                    match node {
                        ProjectionNode::Include => {
                            out.insert(key.clone(), field.clone());
                        }
                        ProjectionNode::Nested(sub) => {
                            if let Some(projected) = sub.include(field) {
                                if !is_empty_result(&projected) {
                                    out.insert(key.clone(), projected);
                                }
                            }
                        }
                        ProjectionNode::Exclude => {}
                    }
                }
                Some(Value::Object(out))
            }
            Value::Array(items) => Some(Value::Array(
                items.iter().filter_map(|item| self.include(item)).collect(),
            )),
            _ => None,
        }
    }
}

fn is_empty_result(value: &Value) -> bool {
    match value {
        Value::Object(obj) => obj.is_empty(),
        Value::Array(items) => items.iter().all(is_empty_result),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn projection(value: Value) -> Projection {
        Projection::from_value(&value).unwrap()
    }

    #[test]
    fn test_exclusion_drops_named_fields() {
        let p = projection(json!({"password": 0}));
        let out = p.apply(&json!({"name": "a", "password": "x"}));
        assert_eq!(out, json!({"name": "a"}));
    }

    #[test]
    fn test_nested_exclusion_keeps_everything_else() {
        let p = projection(json!({"author": {"email": 0}}));
        let out = p.apply(&json!({
            "title": "t",
            "author": {"name": "n", "email": "e"}
        }));
        assert_eq!(out, json!({"title": "t", "author": {"name": "n"}}));
    }

    #[test]
    fn test_inclusion_keeps_only_named_fields() {
        let p = projection(json!({"name": 1, "age": 1}));
        let out = p.apply(&json!({"name": "a", "age": 3, "password": "x"}));
        assert_eq!(out, json!({"name": "a", "age": 3}));
    }

    #[test]
    fn test_nested_inclusion_omits_empty_results() {
        let p = projection(json!({"title": 1, "author": {"photo": 1}}));
        let out = p.apply(&json!({"title": "t", "author": {"name": "n"}}));
        assert_eq!(out, json!({"title": "t"}));
    }

    #[test]
    fn test_inclusion_over_arrays_preserves_order() {
        let p = projection(json!({"items": {"sku": 1}}));
        let out = p.apply(&json!({
            "items": [{"sku": 2, "price": 1}, {"sku": 1, "price": 9}]
        }));
        assert_eq!(out, json!({"items": [{"sku": 2}, {"sku": 1}]}));
    }

    #[test]
    fn test_top_level_array() {
        let p = projection(json!({"name": 1}));
        let out = p.apply(&json!([{"name": "a", "x": 1}, {"name": "b"}]));
        assert_eq!(out, json!([{"name": "a"}, {"name": "b"}]));
    }

    #[test]
    fn test_mixed_projection_rejected() {
        let err = Projection::from_value(&json!({"a": 1, "b": {"c": 0}})).unwrap_err();
        assert_eq!(err, ProjectionError::Mixed);
    }

    #[test]
    fn test_invalid_value_rejected() {
        assert!(matches!(
            Projection::from_value(&json!({"a": 2})),
            Err(ProjectionError::InvalidValue(_, _))
        ));
        assert!(matches!(
            Projection::from_value(&json!([1])),
            Err(ProjectionError::NotAMap(_))
        ));
    }

    #[test]
    fn test_empty_projection_passes_through() {
        let p = Projection::default();
        let doc = json!({"a": 1});
        assert_eq!(p.apply(&doc), doc);
    }
}
