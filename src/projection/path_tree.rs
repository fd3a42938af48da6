//! Path trees
//!
//! Dotted path lists (`include`, `exclude`) are parsed once per query into
//! a tree keyed by first segment. Every document processed by that query
//! reuses the same tree.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::pointer::pointer_key;

/// Tree of dotted paths grouped by first segment
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTree {
    branches: BTreeMap<String, PathTree>,
}

impl PathTree {
    /// Build a tree from dotted paths. Empty segments are ignored.
    pub fn from_paths<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut tree = PathTree::default();
        for path in paths {
            tree.insert(path.as_ref());
        }
        tree
    }

    fn insert(&mut self, path: &str) {
        let mut node = self;
        for segment in path.split('.').filter(|s| !s.is_empty()) {
            node = node.branches.entry(segment.to_string()).or_default();
        }
    }

    /// Whether the tree holds no paths
    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Number of first-level segments
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    /// First-level segments with their subtrees
    pub fn branches(&self) -> impl Iterator<Item = (&String, &PathTree)> {
        self.branches.iter()
    }

    /// Subtree below a first-level segment
    pub fn get(&self, segment: &str) -> Option<&PathTree> {
        self.branches.get(segment)
    }

    /// Remaining dotted sub-paths below a first-level segment
    pub fn subpaths(&self, segment: &str) -> Vec<String> {
        self.branches
            .get(segment)
            .map(PathTree::paths)
            .unwrap_or_default()
    }

    /// Flatten back into dotted paths (leaves only)
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (segment, subtree) in &self.branches {
            if subtree.is_empty() {
                out.push(segment.clone());
            } else {
                out.extend(
                    subtree
                        .paths()
                        .into_iter()
                        .map(|rest| format!("{}.{}", segment, rest)),
                );
            }
        }
        out
    }

    /// Remove every path in the tree from a document or array of documents.
    /// A leaf also removes the pointer-prefixed form of the key.
    pub fn remove_from(&self, value: &mut Value) {
        if self.is_empty() {
            return;
        }
        match value {
            Value::Object(obj) => self.remove_from_object(obj),
            Value::Array(items) => {
                for item in items {
                    self.remove_from(item);
                }
            }
            _ => {}
        }
    }

    fn remove_from_object(&self, obj: &mut Map<String, Value>) {
        for (segment, subtree) in &self.branches {
            if subtree.is_empty() {
                obj.remove(segment);
                obj.remove(&pointer_key(segment));
            } else if let Some(child) = obj.get_mut(segment) {
                subtree.remove_from(child);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_groups_by_first_segment() {
        let tree = PathTree::from_paths(["user.profile.photo", "user.name", "post"]);
        assert_eq!(tree.len(), 2);

        let mut subpaths = tree.subpaths("user");
        subpaths.sort();
        assert_eq!(subpaths, vec!["name", "profile.photo"]);
        assert!(tree.get("post").unwrap().is_empty());
    }

    #[test]
    fn test_round_trip_paths() {
        let tree = PathTree::from_paths(["a.b", "a.c.d", "e"]);
        assert_eq!(tree.paths(), vec!["a.b", "a.c.d", "e"]);
    }

    #[test]
    fn test_remove_nested_paths() {
        let tree = PathTree::from_paths(["secret", "author.email"]);
        let mut doc = json!({
            "title": "t",
            "secret": "s",
            "_p_secret": "User$abcdefghij",
            "author": {"name": "a", "email": "e"}
        });
        tree.remove_from(&mut doc);
        assert_eq!(doc, json!({"title": "t", "author": {"name": "a"}}));
    }

    #[test]
    fn test_remove_through_arrays() {
        let tree = PathTree::from_paths(["items.price"]);
        let mut doc = json!({"items": [{"sku": 1, "price": 2}, {"sku": 3, "price": 4}]});
        tree.remove_from(&mut doc);
        assert_eq!(doc, json!({"items": [{"sku": 1}, {"sku": 3}]}));
    }
}
