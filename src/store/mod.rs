//! # Document Store
//!
//! The seam to the underlying durable store and its change feed. The engine
//! never implements storage itself; it speaks store-native BSON through
//! [`DocumentStore`].
//!
//! - [`MemoryStore`]: in-process store with a broadcast change feed
//! - [`MongoStore`]: MongoDB adapter using change streams

pub mod codec;
pub mod errors;
pub mod matcher;
pub mod memory;
pub mod mongo;

use bson::{doc, Bson, Document};
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use errors::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use mongo::MongoStore;

/// Future returned by store operations
pub type StoreFuture<'a, T> = BoxFuture<'a, StoreResult<T>>;

/// Ordered stream of change events for one watch
pub type ChangeStream = BoxStream<'static, StoreResult<ChangeEvent>>;

/// Options for `find`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    pub sort: Option<Document>,
    pub limit: Option<i64>,
    pub skip: Option<u64>,
}

/// Outcome of an update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSummary {
    pub matched: u64,
    pub modified: u64,
    pub upserted_id: Option<Bson>,
}

/// Kind of change reported by the feed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Invalidate,
    Other,
}

impl OperationType {
    /// Feed spelling of the operation
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Invalidate => "invalidate",
            OperationType::Other => "other",
        }
    }
}

/// Field-level description of an update
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UpdateDescription {
    pub updated_fields: Document,
    pub removed_fields: Vec<String>,
    pub truncated_arrays: Vec<Document>,
}

/// One change-feed event
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation_type: OperationType,
    pub document_key: Option<Document>,
    pub full_document: Option<Document>,
    pub update_description: Option<UpdateDescription>,
}

impl ChangeEvent {
    /// The change envelope in feed shape. Watch pipelines match against it.
    pub fn envelope(&self) -> Document {
        let mut envelope = doc! { "operationType": self.operation_type.as_str() };
        if let Some(key) = &self.document_key {
            envelope.insert("documentKey", key.clone());
        }
        if let Some(full) = &self.full_document {
            envelope.insert("fullDocument", full.clone());
        }
        if let Some(description) = &self.update_description {
            envelope.insert(
                "updateDescription",
                doc! {
                    "updatedFields": description.updated_fields.clone(),
                    "removedFields": description.removed_fields.clone(),
                    "truncatedArrays": description.truncated_arrays.clone(),
                },
            );
        }
        envelope
    }
}

/// Durable document storage with a change feed.
///
/// Collection names are storage names. Filters, updates and pipelines are
/// store-native and come out of the filter translator.
pub trait DocumentStore: Send + Sync {
    /// Find documents matching a filter
    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
        options: FindOptions,
    ) -> StoreFuture<'a, Vec<Document>>;

    /// Find the first document matching a filter
    fn find_one<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
    ) -> StoreFuture<'a, Option<Document>>;

    /// Insert one document
    fn insert_one<'a>(&'a self, collection: &'a str, doc: Document) -> StoreFuture<'a, ()>;

    /// Insert several documents
    fn insert_many<'a>(&'a self, collection: &'a str, docs: Vec<Document>)
        -> StoreFuture<'a, ()>;

    /// Update the first matching document
    fn update_one<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> StoreFuture<'a, WriteSummary>;

    /// Update every matching document
    fn update_many<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> StoreFuture<'a, WriteSummary>;

    /// Count matching documents
    fn count<'a>(&'a self, collection: &'a str, filter: Document) -> StoreFuture<'a, u64>;

    /// Run an aggregation pipeline
    fn aggregate<'a>(
        &'a self,
        collection: &'a str,
        pipeline: Vec<Document>,
    ) -> StoreFuture<'a, Vec<Document>>;

    /// Open a change feed filtered by a pipeline of `$match` stages
    fn watch<'a>(
        &'a self,
        collection: &'a str,
        pipeline: Vec<Document>,
    ) -> StoreFuture<'a, ChangeStream>;
}
