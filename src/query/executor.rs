//! # Query Executor
//!
//! Server-side entry point for descriptors. Per request:
//!
//! 1. Validate (reserved collections, mutation filters, pipeline placement)
//! 2. Translate filter / sort / pipeline to store-native form
//! 3. Cap `limit` unless the caller is elevated
//! 4. Dispatch to the store
//!
//! Mutations run the collection's before hook (which may veto or replace
//! the payload), then invalidate the cache for every affected document and
//! spawn the after hook. Reads pass every document through projection and
//! pointer resolution.
//!
//! Deletes are soft: the document gets `_expires_at` and reads skip it.

use std::sync::Arc;

use bson::{doc, Bson, Document};
use futures_util::future::{BoxFuture, FutureExt};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::context::ExecutionContext;
use super::descriptor::{DocumentQuery, Method};
use super::errors::{QueryError, QueryResult};
use super::naming::validate_collection_name;
use crate::cache::DocumentCache;
use crate::filter::fields::{finalize, portable_document, ID_FIELD};
use crate::filter::{FilterTranslator, CREATED_AT_FIELD, SOFT_DELETE_FIELD, UPDATED_AT_FIELD};
use crate::hooks::{HookContext, HookError, HookEvent, HookOutcome, HookPayload, HookRegistry};
use crate::pointer::{
    alias, new_object_id, DocumentSource, Pointer, PointerError, PointerResolver, PointerResult,
};
use crate::projection::{PathTree, Projection};
use crate::store::codec::format_datetime;
use crate::store::{DocumentStore, FindOptions};

/// Default cap on non-elevated result sizes
pub const DEFAULT_QUERY_LIMIT: i64 = 50;

/// Cached entries that depend on another collection's documents:
/// (source collection, dependent collection, pointer field in dependent)
const CACHE_CASCADES: &[(&str, &str, &str)] = &[("User", "Session", "user")];

/// Executor limits and access rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    /// Maximum `limit` for non-elevated queries
    pub query_limit: i64,
    /// External collection names that require `unlock`
    pub reserved_collections: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            query_limit: DEFAULT_QUERY_LIMIT,
            reserved_collections: vec!["Password".to_string()],
        }
    }
}

/// Result of one executed descriptor
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum QueryOutput {
    /// Single document (or none)
    Doc(Option<Value>),
    /// Document list
    Docs(Vec<Value>),
    /// Count or number of affected documents
    Count(u64),
    /// A before hook vetoed the operation
    Skipped,
}

impl QueryOutput {
    /// Single document, if any
    pub fn into_doc(self) -> Option<Value> {
        match self {
            QueryOutput::Doc(doc) => doc,
            QueryOutput::Docs(docs) => docs.into_iter().next(),
            _ => None,
        }
    }

    /// Document list
    pub fn into_docs(self) -> Vec<Value> {
        match self {
            QueryOutput::Docs(docs) => docs,
            QueryOutput::Doc(doc) => doc.into_iter().collect(),
            _ => Vec::new(),
        }
    }

    /// Count
    pub fn into_count(self) -> u64 {
        match self {
            QueryOutput::Count(n) => n,
            QueryOutput::Docs(docs) => docs.len() as u64,
            QueryOutput::Doc(doc) => u64::from(doc.is_some()),
            QueryOutput::Skipped => 0,
        }
    }

    /// Whether a hook vetoed the operation
    pub fn is_skipped(&self) -> bool {
        matches!(self, QueryOutput::Skipped)
    }
}

/// Result shaping precomputed once per query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultPlan {
    pub projection: Projection,
    pub include: PathTree,
    pub exclude: PathTree,
}

impl ResultPlan {
    /// Parse projection and path lists of a descriptor
    pub fn from_query(query: &DocumentQuery) -> QueryResult<Self> {
        Ok(Self {
            projection: Projection::from_map(&query.projection)?,
            include: PathTree::from_paths(&query.include),
            exclude: PathTree::from_paths(&query.exclude),
        })
    }
}

/// Sends descriptors to an executor
pub trait QueryTransport: Send + Sync {
    /// Trust level of the sending side
    fn context(&self) -> ExecutionContext;

    /// Run a descriptor
    fn send(&self, query: DocumentQuery) -> BoxFuture<'_, QueryResult<QueryOutput>>;
}

/// In-process transport with a fixed execution context
#[derive(Clone)]
pub struct LocalTransport {
    executor: Arc<QueryExecutor>,
    context: ExecutionContext,
}

impl LocalTransport {
    /// Transport for trusted server code
    pub fn server(executor: Arc<QueryExecutor>) -> Self {
        Self {
            executor,
            context: ExecutionContext::Server,
        }
    }

    /// Transport behaving like an untrusted client
    pub fn client(executor: Arc<QueryExecutor>) -> Self {
        Self {
            executor,
            context: ExecutionContext::Client,
        }
    }
}

impl QueryTransport for LocalTransport {
    fn context(&self) -> ExecutionContext {
        self.context
    }

    fn send(&self, query: DocumentQuery) -> BoxFuture<'_, QueryResult<QueryOutput>> {
        self.executor.execute(query, self.context).boxed()
    }
}

fn id_string(id: &Bson) -> Option<String> {
    match id {
        Bson::String(s) => Some(s.clone()),
        Bson::ObjectId(oid) => Some(oid.to_hex()),
        _ => None,
    }
}

fn object_payload(value: &Value, method: Method) -> QueryResult<Map<String, Value>> {
    value
        .as_object()
        .cloned()
        .ok_or(QueryError::MissingDocument(method))
}

fn replacement_doc(payload: HookPayload) -> QueryResult<Map<String, Value>> {
    let doc = match payload {
        HookPayload::Doc(doc) => Some(doc),
        HookPayload::Docs(docs) => docs.into_iter().next(),
    };
    match doc {
        Some(Value::Object(map)) => Ok(map),
        _ => Err(HookError::Failed("replacement payload must be a document".into()).into()),
    }
}

fn replacement_docs(payload: HookPayload) -> QueryResult<Vec<Map<String, Value>>> {
    let docs = match payload {
        HookPayload::Doc(doc) => vec![doc],
        HookPayload::Docs(docs) => docs,
    };
    docs.into_iter()
        .map(|doc| match doc {
            Value::Object(map) => Ok(map),
            _ => Err(HookError::Failed("replacement payload must be documents".into()).into()),
        })
        .collect()
}

fn merged(before: Option<&Value>, changes: &Map<String, Value>) -> Value {
    let mut out = before
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    for (key, value) in changes {
        out.insert(key.clone(), value.clone());
    }
    Value::Object(out)
}

fn not_deleted() -> Document {
    doc! { "$exists": false }
}

/// Executes descriptors against a store
pub struct QueryExecutor {
    store: Arc<dyn DocumentStore>,
    resolver: PointerResolver,
    hooks: Arc<HookRegistry>,
    translator: FilterTranslator,
    config: ExecutorConfig,
}

impl QueryExecutor {
    /// Create an executor over shared collaborators
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<DocumentCache>,
        hooks: Arc<HookRegistry>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            store,
            resolver: PointerResolver::new(cache),
            hooks,
            translator: FilterTranslator::new(),
            config,
        }
    }

    /// The document store
    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// The document cache
    pub fn cache(&self) -> &Arc<DocumentCache> {
        self.resolver.cache()
    }

    /// The hook registry
    pub fn hooks(&self) -> &Arc<HookRegistry> {
        &self.hooks
    }

    /// The filter translator
    pub fn translator(&self) -> &FilterTranslator {
        &self.translator
    }

    /// Limits and access rules
    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Whether a collection requires elevated mode
    pub fn is_reserved(&self, collection: &str) -> bool {
        let external = alias::to_external(collection);
        self.config
            .reserved_collections
            .iter()
            .any(|reserved| reserved == external)
    }

    /// Check a descriptor before dispatch
    pub fn validate(&self, query: &DocumentQuery, context: ExecutionContext) -> QueryResult<Method> {
        let method = query.method.ok_or(QueryError::MissingMethod)?;
        validate_collection_name(&query.collection)?;

        if query.unlock && !context.is_server() {
            return Err(QueryError::UnlockNotAllowed);
        }
        if !query.unlock && self.is_reserved(&query.collection) {
            return Err(QueryError::Unauthorized(query.collection.clone()));
        }
        if method.requires_filter() && query.filter.is_empty() {
            return Err(QueryError::MissingFilter(method));
        }
        if !query.pipeline.is_empty() && method != Method::Aggregate {
            return Err(QueryError::PipelineNotAllowed(method));
        }
        Ok(method)
    }

    /// `limit` after the non-elevated cap
    pub fn effective_limit(&self, query: &DocumentQuery) -> Option<i64> {
        let requested = query.limit.filter(|l| *l > 0);
        if query.unlock {
            return requested;
        }
        let cap = self.config.query_limit;
        Some(requested.map_or(cap, |l| l.min(cap)))
    }

    /// Validate, translate and run a descriptor
    pub async fn execute(
        &self,
        query: DocumentQuery,
        context: ExecutionContext,
    ) -> QueryResult<QueryOutput> {
        let method = self.validate(&query, context)?;
        let plan = ResultPlan::from_query(&query)?;
        let collection = alias::to_internal(&query.collection).to_string();

        debug!(
            collection = %query.collection,
            method = %method,
            unlock = query.unlock,
            "dispatching query"
        );

        match method {
            Method::Find => self.find(&query, &plan, &collection).await,
            Method::FindOne => self.find_one(&query, &plan, &collection).await,
            Method::Get => self.get(&query, &plan, &collection).await,
            Method::Count => self.count(&query, &collection).await,
            Method::Aggregate => self.aggregate(&query, &plan, &collection).await,
            Method::Insert => self.insert(&query, &plan, &collection, context).await,
            Method::InsertMany => self.insert_many(&query, &plan, &collection, context).await,
            Method::Update | Method::Upsert => {
                self.update(&query, method, &plan, &collection, context).await
            }
            Method::UpdateMany | Method::UpsertMany => {
                self.update_many(&query, method, &collection, context).await
            }
            Method::Delete => self.delete(&query, &plan, &collection, context).await,
            Method::DeleteMany => self.delete_many(&query, &collection, context).await,
        }
    }

    // ==================
    // Reads
    // ==================

    fn read_filter(&self, query: &DocumentQuery) -> QueryResult<Document> {
        let mut filter = self.translator.translate_filter(&query.filter)?;
        if !filter.contains_key(SOFT_DELETE_FIELD) {
            filter.insert(SOFT_DELETE_FIELD, not_deleted());
        }
        Ok(filter)
    }

    async fn find(
        &self,
        query: &DocumentQuery,
        plan: &ResultPlan,
        collection: &str,
    ) -> QueryResult<QueryOutput> {
        let filter = self.read_filter(query)?;
        let sort = if query.sort.is_empty() {
            None
        } else {
            Some(self.translator.translate_sort(&query.sort)?)
        };
        let options = FindOptions {
            sort,
            limit: self.effective_limit(query),
            skip: query.skip,
        };

        let docs = self.store.find(collection, filter, options).await?;
        Ok(QueryOutput::Docs(self.present_all(&docs, plan).await?))
    }

    async fn find_one(
        &self,
        query: &DocumentQuery,
        plan: &ResultPlan,
        collection: &str,
    ) -> QueryResult<QueryOutput> {
        let filter = self.read_filter(query)?;
        let found = match self.store.find_one(collection, filter).await? {
            Some(doc) => Some(self.present_document(&doc, plan).await?),
            None => None,
        };
        Ok(QueryOutput::Doc(found))
    }

    async fn get(
        &self,
        query: &DocumentQuery,
        plan: &ResultPlan,
        collection: &str,
    ) -> QueryResult<QueryOutput> {
        let object_id = query
            .object_id
            .as_deref()
            .ok_or(QueryError::MissingObjectId(Method::Get))?;

        let cache = self.cache();
        let cached = cache.get(&query.collection, object_id);
        let raw = match cached {
            Some(hit) => Some(hit),
            None => {
                let fetched = self.fetch_portable(collection, object_id).await?;
                if let Some(doc) = &fetched {
                    cache.set(&query.collection, object_id, doc.clone());
                }
                fetched
            }
        };

        let shaped = match raw {
            Some(doc) => Some(self.shape(doc, plan).await?),
            None => None,
        };
        Ok(QueryOutput::Doc(shaped))
    }

    async fn count(&self, query: &DocumentQuery, collection: &str) -> QueryResult<QueryOutput> {
        let filter = self.read_filter(query)?;
        Ok(QueryOutput::Count(self.store.count(collection, filter).await?))
    }

    async fn aggregate(
        &self,
        query: &DocumentQuery,
        plan: &ResultPlan,
        collection: &str,
    ) -> QueryResult<QueryOutput> {
        let mut pipeline = vec![doc! { "$match": { SOFT_DELETE_FIELD: not_deleted() } }];
        pipeline.extend(self.translator.translate_pipeline(&query.pipeline)?);
        if !query.unlock {
            pipeline.push(doc! { "$limit": self.config.query_limit });
        }

        let docs = self.store.aggregate(collection, pipeline).await?;
        Ok(QueryOutput::Docs(self.present_all(&docs, plan).await?))
    }

    async fn fetch_portable(&self, collection: &str, object_id: &str) -> QueryResult<Option<Value>> {
        let filter = doc! { ID_FIELD: object_id, SOFT_DELETE_FIELD: not_deleted() };
        Ok(self.store.find_one(collection, filter).await?.map(|doc| {
            let mut value = portable_document(&doc);
            finalize(&mut value);
            value
        }))
    }

    /// Look up a session by token. Sessions are cached by token.
    pub async fn find_session(&self, token: &str) -> QueryResult<Option<Value>> {
        let cache = self.cache();
        if let Some(hit) = cache.get("Session", token) {
            return Ok(Some(hit));
        }

        let filter = doc! { "sessionToken": token, SOFT_DELETE_FIELD: not_deleted() };
        let Some(doc) = self
            .store
            .find_one(alias::to_internal("Session"), filter)
            .await?
        else {
            return Ok(None);
        };

        let mut session = portable_document(&doc);
        finalize(&mut session);
        cache.set("Session", token, session.clone());
        Ok(Some(session))
    }

    // ==================
    // Result shaping
    // ==================

    /// Convert a stored document and apply the plan
    pub async fn present_document(&self, doc: &Document, plan: &ResultPlan) -> QueryResult<Value> {
        let mut value = portable_document(doc);
        finalize(&mut value);
        self.shape(value, plan).await
    }

    async fn present_all(&self, docs: &[Document], plan: &ResultPlan) -> QueryResult<Vec<Value>> {
        let mut out = Vec::with_capacity(docs.len());
        for doc in docs {
            out.push(self.present_document(doc, plan).await?);
        }
        Ok(out)
    }

    /// Resolve includes, then project, then drop excluded paths. Projection
    /// sees resolved documents, so nested maps reach included pointers.
    async fn shape(&self, mut doc: Value, plan: &ResultPlan) -> QueryResult<Value> {
        self.resolver.resolve(&mut doc, &plan.include, self).await?;
        let mut shaped = if plan.projection.is_empty() {
            doc
        } else {
            plan.projection.apply(&doc)
        };
        plan.exclude.remove_from(&mut shaped);
        Ok(shaped)
    }

    /// Present a document written by a committed mutation. Shaping failures
    /// are logged and the unshaped document is returned.
    async fn present_committed(&self, doc: &Document, plan: &ResultPlan) -> Value {
        match self.present_document(doc, plan).await {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "failed to shape committed document");
                let mut value = portable_document(doc);
                finalize(&mut value);
                value
            }
        }
    }

    /// Re-read a document after a committed mutation
    async fn reload_committed(
        &self,
        collection: &str,
        object_id: &str,
        plan: &ResultPlan,
    ) -> Option<Value> {
        match self
            .store
            .find_one(collection, doc! { ID_FIELD: object_id })
            .await
        {
            Ok(Some(doc)) => Some(self.present_committed(&doc, plan).await),
            Ok(None) => None,
            Err(e) => {
                warn!(collection, object_id, error = %e, "failed to reload committed document");
                None
            }
        }
    }

    // ==================
    // Mutations
    // ==================

    fn hook_context(
        &self,
        event: HookEvent,
        query: &DocumentQuery,
        method: Method,
        context: ExecutionContext,
    ) -> HookContext {
        HookContext {
            event,
            collection: query.collection.clone(),
            method,
            before: None,
            after: None,
            payload: None,
            query: query.clone(),
            context,
        }
    }

    async fn run_before(&self, ctx: HookContext) -> QueryResult<HookOutcome> {
        if !self.hooks.has(&ctx.collection, ctx.event) {
            return Ok(HookOutcome::Proceed);
        }
        let collection = ctx.collection.clone();
        let outcome = self.hooks.run_before(ctx).await?;
        if outcome == HookOutcome::Veto {
            info!(collection = %collection, "before hook vetoed operation");
        }
        Ok(outcome)
    }

    fn spawn_after(&self, ctx: HookContext) {
        if self.hooks.has(&ctx.collection, ctx.event) {
            self.hooks.spawn_after(ctx);
        }
    }

    /// Drop cached copies of a document and of entries depending on it
    pub fn invalidate(&self, collection: &str, object_id: &str) {
        let cache = self.cache();
        cache.invalidate(collection, object_id);

        for (source, dependent, field) in CACHE_CASCADES {
            if *source != collection {
                continue;
            }
            let target = Pointer::new(collection, object_id).encode();
            let removed = cache.invalidate_where(dependent, |cached| {
                cached.get(*field).and_then(Value::as_str) == Some(target.as_str())
            });
            if removed > 0 {
                debug!(collection, object_id, dependent, removed, "cascaded cache invalidation");
            }
        }

        // sessions are also cached under their token
        if collection == "Session" {
            cache.invalidate_where("Session", |cached| {
                cached.get("objectId").and_then(Value::as_str) == Some(object_id)
            });
        }
    }

    fn prepare_insert(&self, mut doc: Map<String, Value>) -> Map<String, Value> {
        let now = Value::String(format_datetime(bson::DateTime::now()));
        if !doc.get("objectId").is_some_and(Value::is_string) {
            doc.insert("objectId".to_string(), Value::String(new_object_id()));
        }
        doc.insert("createdAt".to_string(), now.clone());
        doc.insert("updatedAt".to_string(), now);
        doc
    }

    fn update_document(&self, changes: &Map<String, Value>, seed_id: bool) -> QueryResult<Document> {
        let mut changes = changes.clone();
        for fixed in ["objectId", "createdAt", "updatedAt", "expiresAt"] {
            changes.remove(fixed);
        }

        let mut set = self.translator.translate_document(&changes)?;
        let now = bson::DateTime::now();
        set.insert(UPDATED_AT_FIELD, now);

        let mut on_insert = doc! { CREATED_AT_FIELD: now };
        if seed_id {
            on_insert.insert(ID_FIELD, new_object_id());
        }
        Ok(doc! { "$set": set, "$setOnInsert": on_insert })
    }

    async fn insert(
        &self,
        query: &DocumentQuery,
        plan: &ResultPlan,
        collection: &str,
        context: ExecutionContext,
    ) -> QueryResult<QueryOutput> {
        let payload = query
            .doc
            .as_ref()
            .ok_or(QueryError::MissingDocument(Method::Insert))?;
        let mut doc = self.prepare_insert(object_payload(payload, Method::Insert)?);

        let mut ctx = self.hook_context(HookEvent::BeforeSave, query, Method::Insert, context);
        ctx.after = Some(Value::Object(doc.clone()));
        ctx.payload = Some(HookPayload::Doc(Value::Object(doc.clone())));
        match self.run_before(ctx).await? {
            HookOutcome::Veto => return Ok(QueryOutput::Skipped),
            HookOutcome::Replace(replacement) => {
                doc = self.prepare_insert(replacement_doc(replacement)?)
            }
            HookOutcome::Proceed => {}
        }

        let stored = self.translator.translate_document(&doc)?;
        self.store.insert_one(collection, stored.clone()).await?;

        let object_id = stored.get(ID_FIELD).and_then(id_string).unwrap_or_default();
        self.invalidate(&query.collection, &object_id);

        let created = self.present_committed(&stored, plan).await;
        let mut ctx = self.hook_context(HookEvent::AfterSave, query, Method::Insert, context);
        ctx.after = Some(created.clone());
        self.spawn_after(ctx);

        Ok(QueryOutput::Doc(Some(created)))
    }

    async fn insert_many(
        &self,
        query: &DocumentQuery,
        plan: &ResultPlan,
        collection: &str,
        context: ExecutionContext,
    ) -> QueryResult<QueryOutput> {
        if query.docs.is_empty() {
            return Err(QueryError::MissingDocument(Method::InsertMany));
        }
        let mut docs = query
            .docs
            .iter()
            .map(|d| object_payload(d, Method::InsertMany).map(|m| self.prepare_insert(m)))
            .collect::<QueryResult<Vec<_>>>()?;

        let mut ctx = self.hook_context(HookEvent::BeforeSave, query, Method::InsertMany, context);
        ctx.payload = Some(HookPayload::Docs(
            docs.iter().cloned().map(Value::Object).collect(),
        ));
        match self.run_before(ctx).await? {
            HookOutcome::Veto => return Ok(QueryOutput::Skipped),
            HookOutcome::Replace(replacement) => {
                docs = replacement_docs(replacement)?
                    .into_iter()
                    .map(|m| self.prepare_insert(m))
                    .collect();
            }
            HookOutcome::Proceed => {}
        }

        let stored = docs
            .iter()
            .map(|d| self.translator.translate_document(d))
            .collect::<Result<Vec<_>, _>>()?;
        self.store.insert_many(collection, stored.clone()).await?;

        for doc in &stored {
            if let Some(id) = doc.get(ID_FIELD).and_then(id_string) {
                self.invalidate(&query.collection, &id);
            }
        }

        let mut created = Vec::with_capacity(stored.len());
        for doc in &stored {
            created.push(self.present_committed(doc, plan).await);
        }
        let mut ctx = self.hook_context(HookEvent::AfterSave, query, Method::InsertMany, context);
        ctx.payload = Some(HookPayload::Docs(created.clone()));
        self.spawn_after(ctx);

        Ok(QueryOutput::Docs(created))
    }

    async fn update(
        &self,
        query: &DocumentQuery,
        method: Method,
        plan: &ResultPlan,
        collection: &str,
        context: ExecutionContext,
    ) -> QueryResult<QueryOutput> {
        let payload = query.doc.as_ref().ok_or(QueryError::MissingDocument(method))?;
        let mut changes = object_payload(payload, method)?;
        let upsert = query.upserts();

        let filter = self.read_filter(query)?;
        let current = self.store.find_one(collection, filter.clone()).await?;
        if current.is_none() && !upsert {
            return Err(QueryError::NotFound(query.collection.clone()));
        }

        let before = current.as_ref().map(|doc| {
            let mut value = portable_document(doc);
            finalize(&mut value);
            value
        });

        let mut ctx = self.hook_context(HookEvent::BeforeSave, query, method, context);
        ctx.before = before.clone();
        ctx.after = Some(merged(before.as_ref(), &changes));
        ctx.payload = Some(HookPayload::Doc(Value::Object(changes.clone())));
        match self.run_before(ctx).await? {
            HookOutcome::Veto => return Ok(QueryOutput::Skipped),
            HookOutcome::Replace(replacement) => changes = replacement_doc(replacement)?,
            HookOutcome::Proceed => {}
        }

        let current_id = current
            .as_ref()
            .and_then(|doc| doc.get(ID_FIELD))
            .and_then(id_string);
        let target = match &current_id {
            Some(id) => doc! { ID_FIELD: id.clone() },
            None => filter,
        };
        let update = self.update_document(&changes, !target.contains_key(ID_FIELD))?;
        let summary = self.store.update_one(collection, target, update, upsert).await?;

        let Some(object_id) = current_id.or_else(|| summary.upserted_id.as_ref().and_then(id_string))
        else {
            return Err(QueryError::NotFound(query.collection.clone()));
        };
        if summary.matched == 0 && summary.upserted_id.is_none() {
            return Err(QueryError::NotFound(query.collection.clone()));
        }

        self.invalidate(&query.collection, &object_id);

        let updated = self.reload_committed(collection, &object_id, plan).await;

        let mut ctx = self.hook_context(HookEvent::AfterSave, query, method, context);
        ctx.before = before;
        ctx.after = updated.clone();
        self.spawn_after(ctx);

        Ok(QueryOutput::Doc(updated))
    }

    async fn update_many(
        &self,
        query: &DocumentQuery,
        method: Method,
        collection: &str,
        context: ExecutionContext,
    ) -> QueryResult<QueryOutput> {
        let payload = query.doc.as_ref().ok_or(QueryError::MissingDocument(method))?;
        let mut changes = object_payload(payload, method)?;
        let upsert = query.upserts();

        let filter = self.read_filter(query)?;
        let affected = self
            .store
            .find(collection, filter.clone(), FindOptions::default())
            .await?;

        let mut ctx = self.hook_context(HookEvent::BeforeSave, query, method, context);
        ctx.payload = Some(HookPayload::Doc(Value::Object(changes.clone())));
        match self.run_before(ctx).await? {
            HookOutcome::Veto => return Ok(QueryOutput::Skipped),
            HookOutcome::Replace(replacement) => changes = replacement_doc(replacement)?,
            HookOutcome::Proceed => {}
        }

        let seed_id = !filter.contains_key(ID_FIELD);
        let update = self.update_document(&changes, seed_id)?;
        let summary = self.store.update_many(collection, filter, update, upsert).await?;

        for id in affected
            .iter()
            .filter_map(|doc| doc.get(ID_FIELD).and_then(id_string))
            .chain(summary.upserted_id.as_ref().and_then(id_string))
        {
            self.invalidate(&query.collection, &id);
        }

        let mut ctx = self.hook_context(HookEvent::AfterSave, query, method, context);
        ctx.payload = Some(HookPayload::Doc(Value::Object(changes)));
        self.spawn_after(ctx);

        let upserted = u64::from(summary.upserted_id.is_some());
        Ok(QueryOutput::Count(summary.modified + upserted))
    }

    async fn delete(
        &self,
        query: &DocumentQuery,
        plan: &ResultPlan,
        collection: &str,
        context: ExecutionContext,
    ) -> QueryResult<QueryOutput> {
        let filter = self.read_filter(query)?;
        let Some(current) = self.store.find_one(collection, filter).await? else {
            return Err(QueryError::NotFound(query.collection.clone()));
        };
        let object_id = current
            .get(ID_FIELD)
            .and_then(id_string)
            .ok_or_else(|| QueryError::NotFound(query.collection.clone()))?;

        let mut before = portable_document(&current);
        finalize(&mut before);

        let mut ctx = self.hook_context(HookEvent::BeforeDelete, query, Method::Delete, context);
        ctx.before = Some(before.clone());
        if self.run_before(ctx).await? == HookOutcome::Veto {
            return Ok(QueryOutput::Skipped);
        }

        let now = bson::DateTime::now();
        let mark = doc! { "$set": { SOFT_DELETE_FIELD: now, UPDATED_AT_FIELD: now } };
        self.store
            .update_one(collection, doc! { ID_FIELD: object_id.as_str() }, mark, false)
            .await?;

        self.invalidate(&query.collection, &object_id);

        let deleted = self.reload_committed(collection, &object_id, plan).await;

        let mut ctx = self.hook_context(HookEvent::AfterDelete, query, Method::Delete, context);
        ctx.before = Some(before);
        ctx.after = deleted.clone();
        self.spawn_after(ctx);

        Ok(QueryOutput::Doc(deleted))
    }

    async fn delete_many(
        &self,
        query: &DocumentQuery,
        collection: &str,
        context: ExecutionContext,
    ) -> QueryResult<QueryOutput> {
        let filter = self.read_filter(query)?;
        let affected = self
            .store
            .find(collection, filter.clone(), FindOptions::default())
            .await?;

        let before: Vec<Value> = affected
            .iter()
            .map(|doc| {
                let mut value = portable_document(doc);
                finalize(&mut value);
                value
            })
            .collect();

        let mut ctx =
            self.hook_context(HookEvent::BeforeDelete, query, Method::DeleteMany, context);
        ctx.payload = Some(HookPayload::Docs(before.clone()));
        if self.run_before(ctx).await? == HookOutcome::Veto {
            return Ok(QueryOutput::Skipped);
        }

        let now = bson::DateTime::now();
        let mark = doc! { "$set": { SOFT_DELETE_FIELD: now, UPDATED_AT_FIELD: now } };
        let summary = self.store.update_many(collection, filter, mark, false).await?;

        for id in affected
            .iter()
            .filter_map(|doc| doc.get(ID_FIELD).and_then(id_string))
        {
            self.invalidate(&query.collection, &id);
        }

        let mut ctx = self.hook_context(HookEvent::AfterDelete, query, Method::DeleteMany, context);
        ctx.payload = Some(HookPayload::Docs(before));
        self.spawn_after(ctx);

        Ok(QueryOutput::Count(summary.matched))
    }
}

impl DocumentSource for QueryExecutor {
    fn fetch<'a>(
        &'a self,
        collection: &'a str,
        object_id: &'a str,
    ) -> BoxFuture<'a, PointerResult<Option<Value>>> {
        async move {
            self.fetch_portable(alias::to_internal(collection), object_id)
                .await
                .map_err(|e| {
                    PointerError::Source(Pointer::new(collection, object_id).encode(), e.to_string())
                })
        }
        .boxed()
    }
}

impl QueryTransport for QueryExecutor {
    fn context(&self) -> ExecutionContext {
        ExecutionContext::Server
    }

    fn send(&self, query: DocumentQuery) -> BoxFuture<'_, QueryResult<QueryOutput>> {
        self.execute(query, ExecutionContext::Server).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    fn executor() -> (Arc<MemoryStore>, QueryExecutor) {
        let store = Arc::new(MemoryStore::new());
        let executor = QueryExecutor::new(
            store.clone(),
            Arc::new(DocumentCache::new(Duration::from_secs(60))),
            Arc::new(HookRegistry::new()),
            ExecutorConfig {
                query_limit: 2,
                ..ExecutorConfig::default()
            },
        );
        (store, executor)
    }

    fn query(collection: &str, method: Method) -> DocumentQuery {
        let mut query = DocumentQuery::new(collection);
        query.method = Some(method);
        query
    }

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_validation_rules() {
        let (_, executor) = executor();

        let q = query("Post", Method::Update);
        assert_eq!(
            executor.validate(&q, ExecutionContext::Server),
            Err(QueryError::MissingFilter(Method::Update))
        );

        let mut q = query("Post", Method::Find);
        q.pipeline = vec![json!({"$match": {}})];
        assert_eq!(
            executor.validate(&q, ExecutionContext::Server),
            Err(QueryError::PipelineNotAllowed(Method::Find))
        );

        let q = query("Password", Method::Find);
        assert_eq!(
            executor.validate(&q, ExecutionContext::Server),
            Err(QueryError::Unauthorized("Password".into()))
        );

        let mut q = query("Password", Method::Find);
        q.unlock = true;
        assert!(executor.validate(&q, ExecutionContext::Server).is_ok());
        assert_eq!(
            executor.validate(&q, ExecutionContext::Client),
            Err(QueryError::UnlockNotAllowed)
        );
    }

    #[test]
    fn test_limit_cap() {
        let (_, executor) = executor();
        let mut q = query("Post", Method::Find);
        assert_eq!(executor.effective_limit(&q), Some(2));
        q.limit = Some(100);
        assert_eq!(executor.effective_limit(&q), Some(2));
        q.limit = Some(1);
        assert_eq!(executor.effective_limit(&q), Some(1));
        q.unlock = true;
        q.limit = Some(100);
        assert_eq!(executor.effective_limit(&q), Some(100));
    }

    #[tokio::test]
    async fn test_insert_then_find_with_cap() {
        let (_, executor) = executor();
        for n in 0..3 {
            let mut q = query("Post", Method::Insert);
            q.doc = Some(json!({"n": n}));
            let created = executor
                .execute(q, ExecutionContext::Client)
                .await
                .unwrap()
                .into_doc()
                .unwrap();
            assert_eq!(created["objectId"].as_str().unwrap().len(), 10);
            assert!(created["createdAt"].is_string());
        }

        let mut q = query("Post", Method::Find);
        q.sort = map(json!({"n": -1}));
        let docs = executor
            .execute(q, ExecutionContext::Client)
            .await
            .unwrap()
            .into_docs();
        let ns: Vec<i64> = docs.iter().map(|d| d["n"].as_i64().unwrap()).collect();
        assert_eq!(ns, vec![2, 1]);
    }

    #[tokio::test]
    async fn test_soft_delete_hides_document() {
        let (store, executor) = executor();
        store
            .insert_one("Post", doc! {"_id": "p000000001", "title": "t"})
            .await
            .unwrap();

        let mut q = query("Post", Method::Delete);
        q.filter = map(json!({"objectId": "p000000001"}));
        let deleted = executor
            .execute(q, ExecutionContext::Server)
            .await
            .unwrap()
            .into_doc()
            .unwrap();
        assert!(deleted["expiresAt"].is_string());

        let q = query("Post", Method::Count);
        let count = executor.execute(q, ExecutionContext::Server).await.unwrap();
        assert_eq!(count, QueryOutput::Count(0));
        assert_eq!(store.len("Post"), 1);

        let mut q = query("Post", Method::Delete);
        q.filter = map(json!({"objectId": "p000000001"}));
        assert_eq!(
            executor.execute(q, ExecutionContext::Server).await,
            Err(QueryError::NotFound("Post".into()))
        );
    }

    #[tokio::test]
    async fn test_update_invalidates_cache() {
        let (store, executor) = executor();
        store
            .insert_one("Post", doc! {"_id": "p000000001", "title": "old"})
            .await
            .unwrap();

        let mut q = query("Post", Method::Get);
        q.object_id = Some("p000000001".into());
        executor.execute(q.clone(), ExecutionContext::Server).await.unwrap();
        assert!(executor.cache().get("Post", "p000000001").is_some());

        let mut update = query("Post", Method::Update);
        update.filter = map(json!({"objectId": "p000000001"}));
        update.doc = Some(json!({"title": "new"}));
        let updated = executor
            .execute(update, ExecutionContext::Server)
            .await
            .unwrap()
            .into_doc()
            .unwrap();
        assert_eq!(updated["title"], "new");
        assert!(executor.cache().get("Post", "p000000001").is_none());

        let fetched = executor
            .execute(q, ExecutionContext::Server)
            .await
            .unwrap()
            .into_doc()
            .unwrap();
        assert_eq!(fetched["title"], "new");
    }

    #[tokio::test]
    async fn test_user_mutation_cascades_to_sessions() {
        let (store, executor) = executor();
        store
            .insert_one("_User", doc! {"_id": "u000000001", "name": "ada"})
            .await
            .unwrap();
        store
            .insert_one(
                "_Session",
                doc! {"_id": "s000000001", "sessionToken": "tok", "_p_user": "User$u000000001"},
            )
            .await
            .unwrap();

        let session = executor.find_session("tok").await.unwrap().unwrap();
        assert_eq!(session["user"], "User$u000000001");
        assert_eq!(executor.cache().size(), 1);

        let mut update = query("User", Method::Update);
        update.filter = map(json!({"objectId": "u000000001"}));
        update.doc = Some(json!({"name": "grace"}));
        executor.execute(update, ExecutionContext::Server).await.unwrap();

        assert!(executor.cache().get("Session", "tok").is_none());
    }

    #[tokio::test]
    async fn test_upsert_creates_document() {
        let (_, executor) = executor();
        let mut q = query("Post", Method::Upsert);
        q.filter = map(json!({"slug": "hello"}));
        q.doc = Some(json!({"title": "Hello"}));
        let created = executor
            .execute(q, ExecutionContext::Server)
            .await
            .unwrap()
            .into_doc()
            .unwrap();

        assert_eq!(created["slug"], "hello");
        assert_eq!(created["title"], "Hello");
        assert_eq!(created["objectId"].as_str().unwrap().len(), 10);
    }

    #[tokio::test]
    async fn test_aggregate_applies_cap() {
        let (store, executor) = executor();
        for n in 0..5_i64 {
            store
                .insert_one("Post", doc! {"_id": format!("p{:09}", n), "n": n})
                .await
                .unwrap();
        }
        let mut q = query("Post", Method::Aggregate);
        q.pipeline = vec![json!({"$sort": {"n": 1}})];
        let docs = executor
            .execute(q, ExecutionContext::Client)
            .await
            .unwrap()
            .into_docs();
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0]["objectId"], "p000000000");
    }
}
