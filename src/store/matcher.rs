//! Filter evaluation and update application over BSON documents.
//!
//! Covers the operator subset the in-memory store supports:
//! `$eq $ne $gt $gte $lt $lte $in $nin $exists $not $and $or $nor` on
//! dotted paths, and the `$set $unset $setOnInsert $inc` update operators.

use std::cmp::Ordering;

use bson::{Bson, Document};

/// Whether a document satisfies a filter
pub fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, condition)| match key.as_str() {
        "$and" => as_documents(condition).iter().all(|f| matches(doc, f)),
        "$or" => {
            let branches = as_documents(condition);
            branches.is_empty() || branches.iter().any(|f| matches(doc, f))
        }
        "$nor" => !as_documents(condition).iter().any(|f| matches(doc, f)),
        path => match_condition(lookup(doc, path), condition),
    })
}

fn as_documents(value: &Bson) -> Vec<&Document> {
    match value {
        Bson::Array(items) => items.iter().filter_map(Bson::as_document).collect(),
        _ => Vec::new(),
    }
}

/// Resolve a dotted path inside a document
pub fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = doc.get(first)?;
    for segment in segments {
        current = match current {
            Bson::Document(inner) => inner.get(segment)?,
            Bson::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn is_operator_document(value: &Bson) -> Option<&Document> {
    match value {
        Bson::Document(doc) if !doc.is_empty() && doc.keys().all(|k| k.starts_with('$')) => {
            Some(doc)
        }
        _ => None,
    }
}

fn match_condition(value: Option<&Bson>, condition: &Bson) -> bool {
    match is_operator_document(condition) {
        Some(operators) => operators
            .iter()
            .all(|(op, operand)| match_operator(value, op, operand)),
        None => equals_or_contains(value, condition),
    }
}

fn match_operator(value: Option<&Bson>, op: &str, operand: &Bson) -> bool {
    match op {
        "$eq" => equals_or_contains(value, operand),
        "$ne" => !equals_or_contains(value, operand),
        "$gt" => compare_to(value, operand, |o| o == Ordering::Greater),
        "$gte" => compare_to(value, operand, |o| o != Ordering::Less),
        "$lt" => compare_to(value, operand, |o| o == Ordering::Less),
        "$lte" => compare_to(value, operand, |o| o != Ordering::Greater),
        "$in" => match operand {
            Bson::Array(options) => options.iter().any(|o| equals_or_contains(value, o)),
            _ => false,
        },
        "$nin" => match operand {
            Bson::Array(options) => !options.iter().any(|o| equals_or_contains(value, o)),
            _ => true,
        },
        "$exists" => {
            let wanted = match operand {
                Bson::Boolean(b) => *b,
                Bson::Int32(i) => *i != 0,
                Bson::Int64(i) => *i != 0,
                _ => true,
            };
            value.is_some() == wanted
        }
        "$not" => !match_condition(value, operand),
        _ => false,
    }
}

fn equals_or_contains(value: Option<&Bson>, expected: &Bson) -> bool {
    match value {
        None => matches!(expected, Bson::Null),
        Some(actual) => {
            if values_equal(actual, expected) {
                return true;
            }
            match actual {
                Bson::Array(items) => items.iter().any(|item| values_equal(item, expected)),
                _ => false,
            }
        }
    }
}

fn compare_to<F>(value: Option<&Bson>, operand: &Bson, accept: F) -> bool
where
    F: Fn(Ordering) -> bool,
{
    let Some(actual) = value else {
        return false;
    };
    match actual {
        Bson::Array(items) => items
            .iter()
            .any(|item| compare_values(item, operand).is_some_and(&accept)),
        _ => compare_values(actual, operand).is_some_and(accept),
    }
}

fn as_f64(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(i) => Some(*i as f64),
        Bson::Int64(i) => Some(*i as f64),
        Bson::Double(f) => Some(*f),
        _ => None,
    }
}

/// Equality with numeric widening
pub fn values_equal(a: &Bson, b: &Bson) -> bool {
    match (as_f64(a), as_f64(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering between comparable values of the same kind
pub fn compare_values(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (as_f64(a), as_f64(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::Null, Bson::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Sort documents by a `{field: 1 | -1}` specification
pub fn sort_documents(docs: &mut [Document], sort: &Document) {
    docs.sort_by(|a, b| {
        for (path, direction) in sort {
            let descending = as_f64(direction).is_some_and(|d| d < 0.0);
            let ordering = match (lookup(a, path), lookup(b, path)) {
                (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            let ordering = if descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });
}

/// Apply an update document in place. `$setOnInsert` only applies when inserting.
pub fn apply_update(doc: &mut Document, update: &Document, inserting: bool) {
    for (op, fields) in update {
        let Some(fields) = fields.as_document() else {
            continue;
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$setOnInsert" if inserting => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$unset" => {
                for (path, _) in fields {
                    unset_path(doc, path);
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let current = lookup(doc, path).cloned().unwrap_or(Bson::Int64(0));
                    set_path(doc, path, increment(&current, delta));
                }
            }
            _ => {}
        }
    }
}

/// Integer sums stay Int64 until they overflow, then become Double
fn increment(current: &Bson, delta: &Bson) -> Bson {
    let integer = |value: &Bson| match value {
        Bson::Int32(n) => Some(i64::from(*n)),
        Bson::Int64(n) => Some(*n),
        _ => None,
    };

    match (integer(current), integer(delta)) {
        (Some(a), Some(b)) => match a.checked_add(b) {
            Some(sum) => Bson::Int64(sum),
            None => Bson::Double(a as f64 + b as f64),
        },
        _ => Bson::Double(as_f64(current).unwrap_or(0.0) + as_f64(delta).unwrap_or(0.0)),
    }
}

/// Seed an upserted document with the equality fields of its filter
pub fn seed_from_filter(filter: &Document) -> Document {
    let mut doc = Document::new();
    for (key, value) in filter {
        if key.starts_with('$') || is_operator_document(value).is_some() {
            continue;
        }
        set_path(&mut doc, key, value.clone());
    }
    doc
}

fn set_path(doc: &mut Document, path: &str, value: Bson) {
    match path.split_once('.') {
        None => {
            doc.insert(path, value);
        }
        Some((head, rest)) => {
            if !matches!(doc.get(head), Some(Bson::Document(_))) {
                doc.insert(head, Document::new());
            }
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                set_path(inner, rest, value);
            }
        }
    }
}

fn unset_path(doc: &mut Document, path: &str) {
    match path.split_once('.') {
        None => {
            doc.remove(path);
        }
        Some((head, rest)) => {
            if let Some(Bson::Document(inner)) = doc.get_mut(head) {
                unset_path(inner, rest);
            }
        }
    }
}

/// Apply a `$project` stage (top-level inclusion or exclusion)
pub fn project(doc: &Document, projection: &Document) -> Document {
    let inclusion = projection
        .iter()
        .any(|(k, v)| k != "_id" && as_f64(v).map_or(matches!(v, Bson::Boolean(true)), |n| n != 0.0));

    if inclusion {
        let mut out = Document::new();
        let id_excluded = projection
            .get("_id")
            .is_some_and(|v| as_f64(v) == Some(0.0) || matches!(v, Bson::Boolean(false)));
        if !id_excluded {
            if let Some(id) = doc.get("_id") {
                out.insert("_id", id.clone());
            }
        }
        for (key, _) in projection.iter().filter(|(k, _)| k.as_str() != "_id") {
            if let Some(value) = doc.get(key) {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    } else {
        let mut out = doc.clone();
        for (key, _) in projection {
            out.remove(key);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn sample() -> Document {
        doc! {
            "_id": "abcdefghij",
            "name": "alice",
            "age": 30_i32,
            "tags": ["a", "b"],
            "profile": {"city": "Lisbon"},
        }
    }

    #[test]
    fn test_equality_and_dotted_paths() {
        let d = sample();
        assert!(matches(&d, &doc! {"name": "alice"}));
        assert!(matches(&d, &doc! {"profile.city": "Lisbon"}));
        assert!(!matches(&d, &doc! {"profile.city": "Porto"}));
        assert!(matches(&d, &doc! {"tags": "b"}));
    }

    #[test]
    fn test_comparison_operators() {
        let d = sample();
        assert!(matches(&d, &doc! {"age": {"$gt": 18_i64}}));
        assert!(matches(&d, &doc! {"age": {"$gte": 30.0, "$lt": 31_i32}}));
        assert!(!matches(&d, &doc! {"age": {"$lte": 29_i32}}));
        assert!(matches(&d, &doc! {"name": {"$in": ["bob", "alice"]}}));
        assert!(matches(&d, &doc! {"name": {"$nin": ["bob"]}}));
        assert!(matches(&d, &doc! {"name": {"$ne": "bob"}}));
    }

    #[test]
    fn test_exists_and_logical() {
        let d = sample();
        assert!(matches(&d, &doc! {"_expires_at": {"$exists": false}}));
        assert!(!matches(&d, &doc! {"name": {"$exists": false}}));
        assert!(matches(&d, &doc! {"$or": [{"name": "bob"}, {"age": 30_i32}]}));
        assert!(!matches(&d, &doc! {"$and": [{"name": "alice"}, {"age": 1_i32}]}));
        assert!(matches(&d, &doc! {"$nor": [{"name": "bob"}]}));
    }

    #[test]
    fn test_datetime_comparison() {
        let d = doc! {"_created_at": bson::DateTime::from_millis(2_000)};
        assert!(matches(
            &d,
            &doc! {"_created_at": {"$gt": bson::DateTime::from_millis(1_000)}}
        ));
    }

    #[test]
    fn test_sort() {
        let mut docs = vec![doc! {"n": 2_i32}, doc! {"n": 3_i32}, doc! {"n": 1_i32}];
        sort_documents(&mut docs, &doc! {"n": -1_i32});
        let order: Vec<i32> = docs.iter().map(|d| d.get_i32("n").unwrap()).collect();
        assert_eq!(order, vec![3, 2, 1]);
    }

    #[test]
    fn test_update_operators() {
        let mut d = sample();
        apply_update(
            &mut d,
            &doc! {
                "$set": {"profile.city": "Porto", "score": 1_i32},
                "$unset": {"tags": ""},
                "$inc": {"age": 1_i32},
                "$setOnInsert": {"ignored": true},
            },
            false,
        );
        assert_eq!(lookup(&d, "profile.city"), Some(&Bson::String("Porto".into())));
        assert!(d.get("tags").is_none());
        assert_eq!(d.get("age"), Some(&Bson::Int64(31)));
        assert!(d.get("ignored").is_none());
    }

    #[test]
    fn test_inc_overflow_falls_back_to_double() {
        let mut d = doc! {"hits": i64::MAX};
        apply_update(&mut d, &doc! {"$inc": {"hits": 1_i32}}, false);
        assert_eq!(d.get("hits"), Some(&Bson::Double(i64::MAX as f64 + 1.0)));

        let mut d = doc! {"hits": 2_i64};
        apply_update(&mut d, &doc! {"$inc": {"hits": -3_i64, "missing": 0.5}}, false);
        assert_eq!(d.get("hits"), Some(&Bson::Int64(-1)));
        assert_eq!(d.get("missing"), Some(&Bson::Double(0.5)));
    }

    #[test]
    fn test_seed_from_filter() {
        let seeded = seed_from_filter(&doc! {"slug": "x", "n": {"$gt": 1_i32}, "$or": []});
        assert_eq!(seeded, doc! {"slug": "x"});
    }

    #[test]
    fn test_project_stage() {
        let d = sample();
        assert_eq!(
            project(&d, &doc! {"name": 1_i32}),
            doc! {"_id": "abcdefghij", "name": "alice"}
        );
        let excluded = project(&d, &doc! {"tags": 0_i32, "profile": 0_i32});
        assert!(excluded.get("tags").is_none());
        assert!(excluded.get("name").is_some());
    }
}
