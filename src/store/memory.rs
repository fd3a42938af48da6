//! In-memory document store
//!
//! Keeps collections as ordered document vectors and publishes every write
//! on a broadcast change feed. Used for tests and embedded deployments.

use std::collections::HashMap;
use std::sync::RwLock;

use bson::{doc, Bson, Document};
use futures_util::stream::{self, StreamExt};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::errors::{StoreError, StoreResult};
use super::matcher;
use super::{
    ChangeEvent, ChangeStream, DocumentStore, FindOptions, OperationType, StoreFuture,
    UpdateDescription, WriteSummary,
};

/// Default change-feed buffer
const FEED_CAPACITY: usize = 1024;

type FeedItem = (String, ChangeEvent);

/// In-memory store
#[derive(Debug)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, Vec<Document>>>,
    feed: RwLock<broadcast::Sender<FeedItem>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            collections: RwLock::new(HashMap::new()),
            feed: RwLock::new(tx),
        }
    }

    /// Number of documents stored in a collection, soft-deleted ones included
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .map(|c| c.get(collection).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    /// Raw stored documents of a collection
    pub fn dump(&self, collection: &str) -> Vec<Document> {
        self.collections
            .read()
            .map(|c| c.get(collection).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// End every open change feed. New watches get a fresh feed.
    pub fn close_feeds(&self) {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        if let Ok(mut feed) = self.feed.write() {
            *feed = tx;
        }
    }

    fn publish(&self, collection: &str, event: ChangeEvent) {
        if let Ok(feed) = self.feed.read() {
            // No receivers is fine
            let _ = feed.send((collection.to_string(), event));
        }
    }

    fn lock_err<E: std::fmt::Display>(e: E) -> StoreError {
        StoreError::Backend(format!("lock poisoned: {}", e))
    }

    fn find_sync(
        &self,
        collection: &str,
        filter: &Document,
        options: &FindOptions,
    ) -> StoreResult<Vec<Document>> {
        let collections = self.collections.read().map_err(Self::lock_err)?;
        let mut docs: Vec<Document> = collections
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .filter(|d| matcher::matches(d, filter))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        drop(collections);

        if let Some(sort) = &options.sort {
            matcher::sort_documents(&mut docs, sort);
        }

        let skip = options.skip.unwrap_or(0) as usize;
        let docs = docs.into_iter().skip(skip);
        Ok(match options.limit {
            Some(limit) if limit > 0 => docs.take(limit as usize).collect(),
            _ => docs.collect(),
        })
    }

    fn insert_sync(&self, collection: &str, docs: Vec<Document>) -> StoreResult<()> {
        {
            let mut collections = self.collections.write().map_err(Self::lock_err)?;
            let stored = collections.entry(collection.to_string()).or_default();
            for doc in &docs {
                if let Some(id) = doc.get("_id") {
                    if stored.iter().any(|d| d.get("_id") == Some(id)) {
                        return Err(StoreError::Backend(format!(
                            "duplicate key {} in {}",
                            id, collection
                        )));
                    }
                }
            }
            stored.extend(docs.iter().cloned());
        }

        for doc in docs {
            self.publish(
                collection,
                ChangeEvent {
                    operation_type: OperationType::Insert,
                    document_key: doc.get("_id").map(|id| doc! { "_id": id.clone() }),
                    full_document: Some(doc),
                    update_description: None,
                },
            );
        }
        Ok(())
    }

    fn update_sync(
        &self,
        collection: &str,
        filter: &Document,
        update: &Document,
        upsert: bool,
        many: bool,
    ) -> StoreResult<WriteSummary> {
        let mut summary = WriteSummary::default();
        let mut events = Vec::new();

        {
            let mut collections = self.collections.write().map_err(Self::lock_err)?;
            let stored = collections.entry(collection.to_string()).or_default();

            for doc in stored.iter_mut() {
                if !matcher::matches(doc, filter) {
                    continue;
                }
                summary.matched += 1;

                let before = doc.clone();
                matcher::apply_update(doc, update, false);
                if *doc != before {
                    summary.modified += 1;
                    events.push(ChangeEvent {
                        operation_type: OperationType::Update,
                        document_key: doc.get("_id").map(|id| doc! { "_id": id.clone() }),
                        full_document: Some(doc.clone()),
                        update_description: Some(describe_update(&before, doc)),
                    });
                }
                if !many {
                    break;
                }
            }

            if summary.matched == 0 && upsert {
                let mut doc = matcher::seed_from_filter(filter);
                matcher::apply_update(&mut doc, update, true);
                summary.upserted_id = doc.get("_id").cloned();
                events.push(ChangeEvent {
                    operation_type: OperationType::Insert,
                    document_key: doc.get("_id").map(|id| doc! { "_id": id.clone() }),
                    full_document: Some(doc.clone()),
                    update_description: None,
                });
                stored.push(doc);
            }
        }

        for event in events {
            self.publish(collection, event);
        }
        Ok(summary)
    }

    fn aggregate_sync(&self, collection: &str, pipeline: &[Document]) -> StoreResult<Vec<Document>> {
        let mut docs = self.find_sync(collection, &Document::new(), &FindOptions::default())?;

        for stage in pipeline {
            let Some((name, spec)) = stage.iter().next() else {
                continue;
            };
            match (name.as_str(), spec) {
                ("$match", Bson::Document(filter)) => {
                    docs.retain(|d| matcher::matches(d, filter));
                }
                ("$sort", Bson::Document(sort)) => matcher::sort_documents(&mut docs, sort),
                ("$skip", n) => {
                    let n = integer(n).unwrap_or(0).max(0) as usize;
                    docs = docs.into_iter().skip(n).collect();
                }
                ("$limit", n) => {
                    let n = integer(n).unwrap_or(0).max(0) as usize;
                    docs.truncate(n);
                }
                ("$project", Bson::Document(projection)) => {
                    docs = docs.iter().map(|d| matcher::project(d, projection)).collect();
                }
                ("$count", Bson::String(field)) => {
                    let mut counted = Document::new();
                    counted.insert(field.clone(), docs.len() as i64);
                    docs = vec![counted];
                }
                (other, _) => {
                    return Err(StoreError::Backend(format!(
                        "unsupported aggregation stage {}",
                        other
                    )))
                }
            }
        }

        Ok(docs)
    }
}

fn integer(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(i) => Some(*i as i64),
        Bson::Int64(i) => Some(*i),
        Bson::Double(f) => Some(*f as i64),
        _ => None,
    }
}

fn describe_update(before: &Document, after: &Document) -> UpdateDescription {
    let mut description = UpdateDescription::default();
    for (key, value) in after {
        if before.get(key) != Some(value) {
            description.updated_fields.insert(key.clone(), value.clone());
        }
    }
    for key in before.keys() {
        if !after.contains_key(key) {
            description.removed_fields.push(key.clone());
        }
    }
    description
}

fn match_stages(pipeline: &[Document]) -> Vec<Document> {
    pipeline
        .iter()
        .filter_map(|stage| stage.get_document("$match").ok().cloned())
        .collect()
}

impl DocumentStore for MemoryStore {
    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
        options: FindOptions,
    ) -> StoreFuture<'a, Vec<Document>> {
        Box::pin(async move { self.find_sync(collection, &filter, &options) })
    }

    fn find_one<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
    ) -> StoreFuture<'a, Option<Document>> {
        Box::pin(async move {
            let options = FindOptions {
                limit: Some(1),
                ..FindOptions::default()
            };
            Ok(self
                .find_sync(collection, &filter, &options)?
                .into_iter()
                .next())
        })
    }

    fn insert_one<'a>(&'a self, collection: &'a str, doc: Document) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.insert_sync(collection, vec![doc]) })
    }

    fn insert_many<'a>(
        &'a self,
        collection: &'a str,
        docs: Vec<Document>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move { self.insert_sync(collection, docs) })
    }

    fn update_one<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> StoreFuture<'a, WriteSummary> {
        Box::pin(async move { self.update_sync(collection, &filter, &update, upsert, false) })
    }

    fn update_many<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> StoreFuture<'a, WriteSummary> {
        Box::pin(async move { self.update_sync(collection, &filter, &update, upsert, true) })
    }

    fn count<'a>(&'a self, collection: &'a str, filter: Document) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            Ok(self
                .find_sync(collection, &filter, &FindOptions::default())?
                .len() as u64)
        })
    }

    fn aggregate<'a>(
        &'a self,
        collection: &'a str,
        pipeline: Vec<Document>,
    ) -> StoreFuture<'a, Vec<Document>> {
        Box::pin(async move { self.aggregate_sync(collection, &pipeline) })
    }

    fn watch<'a>(
        &'a self,
        collection: &'a str,
        pipeline: Vec<Document>,
    ) -> StoreFuture<'a, ChangeStream> {
        Box::pin(async move {
            let rx = self
                .feed
                .read()
                .map_err(Self::lock_err)?
                .subscribe();
            let state = (rx, collection.to_string(), match_stages(&pipeline));

            let feed = stream::unfold(state, |(mut rx, collection, filters)| async move {
                loop {
                    match rx.recv().await {
                        Ok((source, event)) => {
                            if source != collection {
                                continue;
                            }
                            let envelope = event.envelope();
                            if !filters.iter().all(|f| matcher::matches(&envelope, f)) {
                                continue;
                            }
                            return Some((Ok(event), (rx, collection, filters)));
                        }
                        Err(RecvError::Lagged(skipped)) => {
                            let err = StoreError::Feed(format!(
                                "change feed lagged by {} events",
                                skipped
                            ));
                            return Some((Err(err), (rx, collection, filters)));
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            });

            Ok(feed.boxed())
        })
    }
}
