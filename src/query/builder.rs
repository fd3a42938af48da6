//! # Query Builder
//!
//! Fluent construction of [`DocumentQuery`] descriptors. Validation happens
//! here, before anything is sent:
//!
//! - collection names must be singular TitleCase (checked in [`QueryBuilder::new`])
//! - `unlock(true)` fails outside server context
//! - update / delete need a non-empty filter
//! - a pipeline is only accepted by `aggregate`
//!
//! Every terminal method reduces to [`QueryBuilder::run`].

use std::sync::Arc;

use serde_json::{Map, Value};

use super::descriptor::{DocumentQuery, LiveEvent, Method, QueryOptions};
use super::errors::{QueryError, QueryResult};
use super::executor::{QueryOutput, QueryTransport};
use super::naming::validate_collection_name;
use crate::projection::Projection;
use crate::realtime::{LiveMessage, LiveQueryClient, LiveQueryResult, LiveSubscription};

/// Document payload of a terminal call
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Payload {
    #[default]
    None,
    Doc(Value),
    Docs(Vec<Value>),
}

/// Fluent query builder
#[derive(Clone)]
pub struct QueryBuilder {
    transport: Arc<dyn QueryTransport>,
    query: DocumentQuery,
    error: Option<QueryError>,
}

impl std::fmt::Debug for QueryBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryBuilder")
            .field("query", &self.query)
            .field("error", &self.error)
            .finish()
    }
}

fn into_map(value: Value, what: &str) -> Result<Map<String, Value>, QueryError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(QueryError::InvalidQuery(format!(
            "{} must be a map, got {}",
            what, other
        ))),
    }
}

impl QueryBuilder {
    /// Start a query on an external collection
    pub fn new(collection: &str, transport: Arc<dyn QueryTransport>) -> QueryResult<Self> {
        validate_collection_name(collection)?;
        Ok(Self {
            transport,
            query: DocumentQuery::new(collection),
            error: None,
        })
    }

    /// Descriptor built so far
    pub fn descriptor(&self) -> &DocumentQuery {
        &self.query
    }

    fn fail(mut self, error: QueryError) -> Self {
        self.error.get_or_insert(error);
        self
    }

    /// Filter map
    pub fn filter(mut self, filter: Value) -> Self {
        match into_map(filter, "filter") {
            Ok(map) => {
                self.query.filter = map;
                self
            }
            Err(e) => self.fail(e),
        }
    }

    /// Sort map (`1` / `-1` or `"asc"` / `"desc"`)
    pub fn sort(mut self, sort: Value) -> Self {
        match into_map(sort, "sort") {
            Ok(map) => {
                self.query.sort = map;
                self
            }
            Err(e) => self.fail(e),
        }
    }

    /// Projection map; mixing inclusion and exclusion fails
    pub fn projection(mut self, projection: Value) -> Self {
        let map = match into_map(projection, "projection") {
            Ok(map) => map,
            Err(e) => return self.fail(e),
        };
        if let Err(e) = Projection::from_map(&map) {
            return self.fail(e.into());
        }
        self.query.projection = map;
        self
    }

    /// Pointer paths to resolve
    pub fn include<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.include.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Paths removed from results
    pub fn exclude<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.query.exclude.extend(paths.into_iter().map(Into::into));
        self
    }

    /// Aggregation pipeline
    pub fn pipeline(mut self, stages: Vec<Value>) -> Self {
        self.query.pipeline = stages;
        self
    }

    /// Maximum number of results
    pub fn limit(mut self, limit: i64) -> Self {
        self.query.limit = Some(limit);
        self
    }

    /// Number of results to skip
    pub fn skip(mut self, skip: u64) -> Self {
        self.query.skip = Some(skip);
        self
    }

    /// Elevated mode. Fails immediately outside server context.
    pub fn unlock(mut self, unlock: bool) -> QueryResult<Self> {
        if unlock && !self.transport.context().is_server() {
            return Err(QueryError::UnlockNotAllowed);
        }
        self.query.unlock = unlock;
        Ok(self)
    }

    fn check(&self, query: &DocumentQuery, method: Method) -> QueryResult<()> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        if method.requires_filter() && query.filter.is_empty() {
            return Err(QueryError::MissingFilter(method));
        }
        if !query.pipeline.is_empty() && method != Method::Aggregate {
            return Err(QueryError::PipelineNotAllowed(method));
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        mut query: DocumentQuery,
        method: Method,
        options: QueryOptions,
        payload: Payload,
        object_id: Option<&str>,
    ) -> QueryResult<QueryOutput> {
        self.check(&query, method)?;

        query.method = Some(method);
        query.options = options;
        query.object_id = object_id.map(str::to_string);
        match payload {
            Payload::None => {}
            Payload::Doc(doc) => query.doc = Some(doc),
            Payload::Docs(docs) => query.docs = docs,
        }

        self.transport.send(query).await
    }

    /// Canonical terminal call
    pub async fn run(
        &self,
        method: Method,
        options: QueryOptions,
        payload: Payload,
        object_id: Option<&str>,
    ) -> QueryResult<QueryOutput> {
        self.dispatch(self.query.clone(), method, options, payload, object_id)
            .await
    }

    /// Matching documents
    pub async fn find(&self) -> QueryResult<Vec<Value>> {
        Ok(self
            .run(Method::Find, QueryOptions::default(), Payload::None, None)
            .await?
            .into_docs())
    }

    /// First matching document. With an id and no shaping modifiers this is
    /// a direct by-id fetch; otherwise the id joins the filter.
    pub async fn find_one(&self, object_id: Option<&str>) -> QueryResult<Option<Value>> {
        let output = match object_id {
            Some(id) if !self.query.has_read_modifiers() => {
                self.run(Method::Get, QueryOptions::default(), Payload::None, Some(id))
                    .await?
            }
            Some(id) => {
                let mut query = self.query.clone();
                query
                    .filter
                    .insert("objectId".to_string(), Value::String(id.to_string()));
                self.dispatch(query, Method::FindOne, QueryOptions::default(), Payload::None, None)
                    .await?
            }
            None => {
                self.run(Method::FindOne, QueryOptions::default(), Payload::None, None)
                    .await?
            }
        };
        Ok(output.into_doc())
    }

    /// Insert one document. `None` when a hook vetoed it.
    pub async fn insert(&self, doc: Value) -> QueryResult<Option<Value>> {
        Ok(self
            .run(Method::Insert, QueryOptions::default(), Payload::Doc(doc), None)
            .await?
            .into_doc())
    }

    /// Insert several documents
    pub async fn insert_many(&self, docs: Vec<Value>) -> QueryResult<Vec<Value>> {
        Ok(self
            .run(Method::InsertMany, QueryOptions::default(), Payload::Docs(docs), None)
            .await?
            .into_docs())
    }

    /// Update the first matching document
    pub async fn update(&self, changes: Value) -> QueryResult<Option<Value>> {
        Ok(self
            .run(Method::Update, QueryOptions::default(), Payload::Doc(changes), None)
            .await?
            .into_doc())
    }

    /// Update every matching document; returns the number modified
    pub async fn update_many(&self, changes: Value) -> QueryResult<u64> {
        Ok(self
            .run(Method::UpdateMany, QueryOptions::default(), Payload::Doc(changes), None)
            .await?
            .into_count())
    }

    /// Update the first match or insert
    pub async fn upsert(&self, changes: Value) -> QueryResult<Option<Value>> {
        let options = QueryOptions { upsert: true };
        Ok(self
            .run(Method::Upsert, options, Payload::Doc(changes), None)
            .await?
            .into_doc())
    }

    /// Update every match or insert
    pub async fn upsert_many(&self, changes: Value) -> QueryResult<u64> {
        let options = QueryOptions { upsert: true };
        Ok(self
            .run(Method::UpsertMany, options, Payload::Doc(changes), None)
            .await?
            .into_count())
    }

    /// Delete the first matching document
    pub async fn delete(&self) -> QueryResult<Option<Value>> {
        Ok(self
            .run(Method::Delete, QueryOptions::default(), Payload::None, None)
            .await?
            .into_doc())
    }

    /// Delete every matching document; returns the number deleted
    pub async fn delete_many(&self) -> QueryResult<u64> {
        Ok(self
            .run(Method::DeleteMany, QueryOptions::default(), Payload::None, None)
            .await?
            .into_count())
    }

    /// Number of matching documents
    pub async fn count(&self) -> QueryResult<u64> {
        Ok(self
            .run(Method::Count, QueryOptions::default(), Payload::None, None)
            .await?
            .into_count())
    }

    /// Run the pipeline
    pub async fn aggregate(&self) -> QueryResult<Vec<Value>> {
        Ok(self
            .run(Method::Aggregate, QueryOptions::default(), Payload::None, None)
            .await?
            .into_docs())
    }

    // ==================
    // Live queries
    // ==================

    /// Handshake descriptor for a live query
    pub fn live_query(&self, event: LiveEvent) -> QueryResult<DocumentQuery> {
        let mut query = self.query.clone();
        self.check(&query, Method::Find)?;
        query.method = Some(Method::Find);
        query.event = Some(event);
        Ok(query)
    }

    /// Subscribe to changes; reconnects until unsubscribed or rejected
    pub fn on(&self, event: LiveEvent, client: &LiveQueryClient) -> QueryResult<LiveSubscription> {
        Ok(client.subscribe(self.live_query(event)?))
    }

    /// Wait for exactly one change
    pub async fn once(
        &self,
        event: LiveEvent,
        client: &LiveQueryClient,
    ) -> LiveQueryResult<LiveMessage> {
        let query = self.live_query(event)?;
        client.once(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::ExecutionContext;
    use futures_util::future::{BoxFuture, FutureExt};
    use serde_json::json;
    use std::sync::Mutex;

    struct Recorder {
        context: ExecutionContext,
        sent: Mutex<Vec<DocumentQuery>>,
    }

    impl Recorder {
        fn new(context: ExecutionContext) -> Arc<Self> {
            Arc::new(Self {
                context,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<DocumentQuery> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl QueryTransport for Recorder {
        fn context(&self) -> ExecutionContext {
            self.context
        }

        fn send(&self, query: DocumentQuery) -> BoxFuture<'_, QueryResult<QueryOutput>> {
            self.sent.lock().unwrap().push(query);
            async { Ok(QueryOutput::Doc(None)) }.boxed()
        }
    }

    #[test]
    fn test_collection_naming_checked_at_construction() {
        let transport = Recorder::new(ExecutionContext::Client);
        assert!(QueryBuilder::new("User", transport.clone()).is_ok());
        assert_eq!(
            QueryBuilder::new("Users", transport.clone()).unwrap_err(),
            QueryError::CollectionPlural("Users".into())
        );
        assert!(transport.sent().is_empty());
    }

    #[test]
    fn test_unlock_is_server_only() {
        let client = Recorder::new(ExecutionContext::Client);
        let err = QueryBuilder::new("Post", client).unwrap().unlock(true).unwrap_err();
        assert_eq!(err, QueryError::UnlockNotAllowed);

        let server = Recorder::new(ExecutionContext::Server);
        let builder = QueryBuilder::new("Post", server).unwrap().unlock(true).unwrap();
        assert!(builder.descriptor().unlock);
    }

    #[tokio::test]
    async fn test_mutations_need_filter_before_sending() {
        let transport = Recorder::new(ExecutionContext::Client);
        let builder = QueryBuilder::new("Post", transport.clone()).unwrap();

        assert_eq!(
            builder.update(json!({"a": 1})).await.unwrap_err(),
            QueryError::MissingFilter(Method::Update)
        );
        assert_eq!(
            builder.delete_many().await.unwrap_err(),
            QueryError::MissingFilter(Method::DeleteMany)
        );
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_pipeline_only_with_aggregate() {
        let transport = Recorder::new(ExecutionContext::Client);
        let builder = QueryBuilder::new("Post", transport.clone())
            .unwrap()
            .pipeline(vec![json!({"$match": {}})]);

        assert_eq!(
            builder.find().await.unwrap_err(),
            QueryError::PipelineNotAllowed(Method::Find)
        );
        builder.aggregate().await.unwrap();
        assert_eq!(transport.sent()[0].method, Some(Method::Aggregate));
    }

    #[tokio::test]
    async fn test_find_one_by_id_degenerates_or_promotes() {
        let transport = Recorder::new(ExecutionContext::Client);
        let plain = QueryBuilder::new("Post", transport.clone()).unwrap();
        plain.find_one(Some("abcdefghij")).await.unwrap();

        let shaped = plain.clone().include(["author"]);
        shaped.find_one(Some("abcdefghij")).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].method, Some(Method::Get));
        assert_eq!(sent[0].object_id.as_deref(), Some("abcdefghij"));
        assert_eq!(sent[1].method, Some(Method::FindOne));
        assert_eq!(sent[1].filter["objectId"], "abcdefghij");
        assert_eq!(sent[1].object_id, None);
    }

    #[tokio::test]
    async fn test_invalid_modifiers_surface_on_run() {
        let transport = Recorder::new(ExecutionContext::Client);
        let builder = QueryBuilder::new("Post", transport.clone())
            .unwrap()
            .projection(json!({"a": 1, "b": 0}));
        assert!(matches!(
            builder.find().await.unwrap_err(),
            QueryError::Projection(_)
        ));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_terminal_methods_set_payload() {
        let transport = Recorder::new(ExecutionContext::Client);
        let builder = QueryBuilder::new("Post", transport.clone())
            .unwrap()
            .filter(json!({"slug": "x"}));
        builder.upsert(json!({"title": "t"})).await.unwrap();
        builder.insert_many(vec![json!({"a": 1})]).await.unwrap();

        let sent = transport.sent();
        assert_eq!(sent[0].method, Some(Method::Upsert));
        assert!(sent[0].options.upsert);
        assert_eq!(sent[0].doc, Some(json!({"title": "t"})));
        assert_eq!(sent[1].docs, vec![json!({"a": 1})]);
    }

    #[test]
    fn test_live_query_descriptor() {
        let transport = Recorder::new(ExecutionContext::Client);
        let builder = QueryBuilder::new("Post", transport)
            .unwrap()
            .filter(json!({"title": "t"}));
        let query = builder.live_query(LiveEvent::Delete).unwrap();
        assert_eq!(query.event, Some(LiveEvent::Delete));
        assert_eq!(query.method, Some(Method::Find));
    }
}
