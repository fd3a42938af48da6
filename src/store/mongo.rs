//! MongoDB adapter
//!
//! Change feeds map to MongoDB change streams opened with
//! `fullDocument: updateLookup`, so update events carry the post-image.

use bson::{doc, Document};
use futures_util::{StreamExt, TryStreamExt};
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType as MongoOperation};
use mongodb::options::FullDocumentType;
use mongodb::{Client, Collection, Database};
use tracing::info;

use super::errors::{StoreError, StoreResult};
use super::{
    ChangeEvent, ChangeStream, DocumentStore, FindOptions, OperationType, StoreFuture,
    UpdateDescription, WriteSummary,
};

/// MongoDB-backed store
#[derive(Debug, Clone)]
pub struct MongoStore {
    db: Database,
}

impl MongoStore {
    /// Connect and verify the server answers a ping
    pub async fn connect(uri: &str, database: &str) -> StoreResult<Self> {
        info!(database, "connecting to document store");

        let client = Client::with_uri_str(uri)
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to connect: {}", e)))?;

        let db = client.database(database);
        db.run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| StoreError::Connection(format!("Ping failed: {}", e)))?;

        info!(database, "connected to document store");
        Ok(Self { db })
    }

    /// Wrap an existing database handle
    pub fn from_database(db: Database) -> Self {
        Self { db }
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.db.collection::<Document>(name)
    }
}

fn summary(result: mongodb::results::UpdateResult) -> WriteSummary {
    WriteSummary {
        matched: result.matched_count,
        modified: result.modified_count,
        upserted_id: result.upserted_id,
    }
}

fn convert_event(event: ChangeStreamEvent<Document>) -> ChangeEvent {
    let operation_type = match event.operation_type {
        MongoOperation::Insert => OperationType::Insert,
        MongoOperation::Update => OperationType::Update,
        MongoOperation::Replace => OperationType::Replace,
        MongoOperation::Delete => OperationType::Delete,
        MongoOperation::Invalidate => OperationType::Invalidate,
        _ => OperationType::Other,
    };

    let update_description = event.update_description.map(|d| UpdateDescription {
        updated_fields: d.updated_fields,
        removed_fields: d.removed_fields,
        truncated_arrays: d
            .truncated_arrays
            .unwrap_or_default()
            .into_iter()
            .map(|t| doc! { "field": t.field, "newSize": t.new_size })
            .collect(),
    });

    ChangeEvent {
        operation_type,
        document_key: event.document_key,
        full_document: event.full_document,
        update_description,
    }
}

impl DocumentStore for MongoStore {
    fn find<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
        options: FindOptions,
    ) -> StoreFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let coll = self.collection(collection);
            let mut find = coll.find(filter);
            if let Some(sort) = options.sort {
                find = find.sort(sort);
            }
            if let Some(limit) = options.limit {
                find = find.limit(limit);
            }
            if let Some(skip) = options.skip {
                find = find.skip(skip);
            }
            let cursor = find.await?;
            Ok(cursor.try_collect().await?)
        })
    }

    fn find_one<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
    ) -> StoreFuture<'a, Option<Document>> {
        Box::pin(async move { Ok(self.collection(collection).find_one(filter).await?) })
    }

    fn insert_one<'a>(&'a self, collection: &'a str, doc: Document) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.collection(collection).insert_one(doc).await?;
            Ok(())
        })
    }

    fn insert_many<'a>(
        &'a self,
        collection: &'a str,
        docs: Vec<Document>,
    ) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            if docs.is_empty() {
                return Ok(());
            }
            let expected = docs.len();
            let result = self.collection(collection).insert_many(docs).await?;
            if result.inserted_ids.len() != expected {
                return Err(StoreError::WriteNotAcknowledged(format!(
                    "inserted {} of {} documents",
                    result.inserted_ids.len(),
                    expected
                )));
            }
            Ok(())
        })
    }

    fn update_one<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> StoreFuture<'a, WriteSummary> {
        Box::pin(async move {
            let result = self
                .collection(collection)
                .update_one(filter, update)
                .upsert(upsert)
                .await?;
            Ok(summary(result))
        })
    }

    fn update_many<'a>(
        &'a self,
        collection: &'a str,
        filter: Document,
        update: Document,
        upsert: bool,
    ) -> StoreFuture<'a, WriteSummary> {
        Box::pin(async move {
            let result = self
                .collection(collection)
                .update_many(filter, update)
                .upsert(upsert)
                .await?;
            Ok(summary(result))
        })
    }

    fn count<'a>(&'a self, collection: &'a str, filter: Document) -> StoreFuture<'a, u64> {
        Box::pin(async move { Ok(self.collection(collection).count_documents(filter).await?) })
    }

    fn aggregate<'a>(
        &'a self,
        collection: &'a str,
        pipeline: Vec<Document>,
    ) -> StoreFuture<'a, Vec<Document>> {
        Box::pin(async move {
            let cursor = self.collection(collection).aggregate(pipeline).await?;
            Ok(cursor.try_collect().await?)
        })
    }

    fn watch<'a>(
        &'a self,
        collection: &'a str,
        pipeline: Vec<Document>,
    ) -> StoreFuture<'a, ChangeStream> {
        Box::pin(async move {
            let stream = self
                .collection(collection)
                .watch()
                .pipeline(pipeline)
                .full_document(FullDocumentType::UpdateLookup)
                .await?;

            let feed = stream.map(|item| {
                item.map(convert_event)
                    .map_err(|e| StoreError::Feed(e.to_string()))
            });
            Ok(feed.boxed())
        })
    }
}
