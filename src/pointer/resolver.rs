//! # Pointer Resolution
//!
//! Joins pointer-valued fields into embedded documents along an explicit
//! [`PathTree`]. Targets come from the [`DocumentCache`] when live, and
//! otherwise from one by-id fetch per pointer through a [`DocumentSource`].
//!
//! Descent is bounded by the path tree, so resolution never cycles. A field
//! that already holds a document is descended into, not fetched again.

use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::{Map, Value};
use tracing::debug;

use super::codec::{pointer_key, Pointer};
use super::errors::PointerResult;
use crate::cache::DocumentCache;
use crate::projection::PathTree;

/// Fetches pointer targets by id in elevated mode.
///
/// Returned documents are portable and final: internal fields stripped,
/// nothing resolved.
pub trait DocumentSource: Send + Sync {
    /// Fetch one document of an external collection by id
    fn fetch<'a>(
        &'a self,
        collection: &'a str,
        object_id: &'a str,
    ) -> BoxFuture<'a, PointerResult<Option<Value>>>;
}

/// Resolves include paths against documents
#[derive(Debug, Clone)]
pub struct PointerResolver {
    cache: Arc<DocumentCache>,
}

impl PointerResolver {
    /// Create a resolver backed by a shared cache
    pub fn new(cache: Arc<DocumentCache>) -> Self {
        Self { cache }
    }

    /// The backing cache
    pub fn cache(&self) -> &Arc<DocumentCache> {
        &self.cache
    }

    /// Resolve every path of `tree` inside a document or array of documents
    pub fn resolve<'a>(
        &'a self,
        value: &'a mut Value,
        tree: &'a PathTree,
        source: &'a dyn DocumentSource,
    ) -> BoxFuture<'a, PointerResult<()>> {
        async move {
            if tree.is_empty() {
                return Ok(());
            }
            match value {
                Value::Array(items) => {
                    for item in items.iter_mut() {
                        self.resolve(item, tree, source).await?;
                    }
                }
                Value::Object(obj) => self.resolve_object(obj, tree, source).await?,
                _ => {}
            }
            Ok(())
        }
        .boxed()
    }

    async fn resolve_object(
        &self,
        obj: &mut Map<String, Value>,
        tree: &PathTree,
        source: &dyn DocumentSource,
    ) -> PointerResult<()> {
        for (segment, subtree) in tree.branches() {
            let prefixed = obj.remove(&pointer_key(segment));
            let field = match obj.remove(segment.as_str()) {
                Some(Value::Null) | None => match prefixed {
                    Some(raw) => raw,
                    None => continue,
                },
                Some(present) => present,
            };

            let resolved = self.resolve_field(field, subtree, source).await?;
            obj.insert(segment.clone(), resolved);
        }
        Ok(())
    }

    fn resolve_field<'a>(
        &'a self,
        field: Value,
        subtree: &'a PathTree,
        source: &'a dyn DocumentSource,
    ) -> BoxFuture<'a, PointerResult<Value>> {
        async move {
            match field {
                Value::String(raw) => match Pointer::decode(&raw) {
                    Ok(pointer) => match self.load(&pointer, source).await? {
                        Some(mut target) => {
                            self.resolve(&mut target, subtree, source).await?;
                            Ok(target)
                        }
                        None => Ok(Value::String(raw)),
                    },
                    Err(_) => Ok(Value::String(raw)),
                },
                Value::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.resolve_field(item, subtree, source).await?);
                    }
                    Ok(Value::Array(out))
                }
                mut populated @ Value::Object(_) => {
                    self.resolve(&mut populated, subtree, source).await?;
                    Ok(populated)
                }
                other => Ok(other),
            }
        }
        .boxed()
    }

    async fn load(
        &self,
        pointer: &Pointer,
        source: &dyn DocumentSource,
    ) -> PointerResult<Option<Value>> {
        if let Some(hit) = self.cache.get(&pointer.collection, &pointer.object_id) {
            return Ok(Some(hit));
        }

        let fetched = source
            .fetch(&pointer.collection, &pointer.object_id)
            .await?;
        match &fetched {
            Some(doc) => self
                .cache
                .set(&pointer.collection, &pointer.object_id, doc.clone()),
            None => debug!(pointer = %pointer, "pointer target missing"),
        }
        Ok(fetched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::json;

    #[derive(Default)]
    struct FakeSource {
        docs: HashMap<(String, String), Value>,
        fetches: AtomicUsize,
    }

    impl FakeSource {
        fn with(mut self, collection: &str, id: &str, doc: Value) -> Self {
            self.docs.insert((collection.into(), id.into()), doc);
            self
        }
    }

    impl DocumentSource for FakeSource {
        fn fetch<'a>(
            &'a self,
            collection: &'a str,
            object_id: &'a str,
        ) -> BoxFuture<'a, PointerResult<Option<Value>>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let doc = self
                .docs
                .get(&(collection.to_string(), object_id.to_string()))
                .cloned();
            async move { Ok(doc) }.boxed()
        }
    }

    fn resolver() -> PointerResolver {
        PointerResolver::new(Arc::new(DocumentCache::new(Duration::from_secs(60))))
    }

    #[tokio::test]
    async fn test_prefixed_pointer_resolved_and_key_removed() {
        let source = FakeSource::default().with(
            "User",
            "abcdefghij",
            json!({"objectId": "abcdefghij", "name": "ada"}),
        );
        let mut doc = json!({"_p_author": "User$abcdefghij", "title": "t"});
        let tree = PathTree::from_paths(["author"]);

        resolver().resolve(&mut doc, &tree, &source).await.unwrap();

        assert_eq!(
            doc,
            json!({"author": {"objectId": "abcdefghij", "name": "ada"}, "title": "t"})
        );
    }

    #[tokio::test]
    async fn test_nested_paths_and_cache_reuse() {
        let source = FakeSource::default()
            .with("Post", "p000000001", json!({"author": "User$abcdefghij"}))
            .with("User", "abcdefghij", json!({"name": "ada"}));
        let resolver = resolver();
        let tree = PathTree::from_paths(["post.author"]);

        let mut docs = json!([
            {"post": "Post$p000000001"},
            {"post": "Post$p000000001"},
        ]);
        resolver.resolve(&mut docs, &tree, &source).await.unwrap();

        assert_eq!(docs[0]["post"]["author"]["name"], "ada");
        assert_eq!(docs[1]["post"]["author"]["name"], "ada");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_arrays_keep_order_and_missing_targets_skip() {
        let source = FakeSource::default()
            .with("User", "aaaaaaaaaa", json!({"n": 1}))
            .with("User", "cccccccccc", json!({"n": 3}));
        let mut doc = json!({"members": ["User$aaaaaaaaaa", "User$bbbbbbbbbb", "User$cccccccccc"]});
        let tree = PathTree::from_paths(["members"]);

        resolver().resolve(&mut doc, &tree, &source).await.unwrap();

        assert_eq!(
            doc["members"],
            json!([{"n": 1}, "User$bbbbbbbbbb", {"n": 3}])
        );
    }

    #[tokio::test]
    async fn test_populated_objects_are_descended_not_fetched() {
        let source = FakeSource::default().with("User", "abcdefghij", json!({"name": "ada"}));
        let mut doc = json!({"post": {"title": "t", "author": "User$abcdefghij"}});
        let tree = PathTree::from_paths(["post.author"]);

        let resolver = resolver();
        resolver.resolve(&mut doc, &tree, &source).await.unwrap();
        let once = doc.clone();
        resolver.resolve(&mut doc, &tree, &source).await.unwrap();

        assert_eq!(doc, once);
        assert_eq!(doc["post"]["author"]["name"], "ada");
        assert_eq!(source.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_cache_fetches_every_time() {
        let source = FakeSource::default().with("User", "abcdefghij", json!({"name": "ada"}));
        let resolver = resolver();
        resolver.cache().disable();
        let tree = PathTree::from_paths(["author"]);

        for _ in 0..2 {
            let mut doc = json!({"author": "User$abcdefghij"});
            resolver.resolve(&mut doc, &tree, &source).await.unwrap();
        }
        assert_eq!(source.fetches.load(Ordering::SeqCst), 2);
    }
}
