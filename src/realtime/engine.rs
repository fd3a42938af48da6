//! # Live Query Engine
//!
//! Server side of a live query. [`LiveQueryEngine::open`] installs a change
//! feed on the target collection and returns a [`LiveFeed`] that turns
//! qualifying changes into [`LiveMessage`]s.
//!
//! Deletes are soft, so a `delete` subscription watches update events and
//! only qualifies those whose document carries the expiry marker. An
//! `update` subscription skips them.

use std::sync::Arc;

use bson::{doc, Document};
use futures_util::StreamExt;
use serde_json::Value;
use tracing::{debug, error, info};

use super::errors::{LiveQueryError, LiveQueryResult};
use super::protocol::LiveMessage;
use super::state::{ServerEvent, ServerState};
use crate::filter::fields::{finalize, portable_document, to_portable};
use crate::filter::{address_envelope, SOFT_DELETE_FIELD};
use crate::pointer::alias;
use crate::query::{DocumentQuery, LiveEvent, QueryError, QueryExecutor, QueryResult, ResultPlan};
use crate::store::codec::document_to_json;
use crate::store::{ChangeEvent, ChangeStream, OperationType};

/// Envelope field holding the changed document
const FULL_DOCUMENT: &str = "fullDocument";

/// Opens live-query feeds
pub struct LiveQueryEngine {
    executor: Arc<QueryExecutor>,
}

impl LiveQueryEngine {
    pub fn new(executor: Arc<QueryExecutor>) -> Self {
        Self { executor }
    }

    /// Executor used for shaping and session checks
    pub fn executor(&self) -> &Arc<QueryExecutor> {
        &self.executor
    }

    /// Feed pipeline for a descriptor: one `$match` on the event type and,
    /// when the caller filters, one on the envelope-addressed filter
    pub fn feed_pipeline(&self, query: &DocumentQuery) -> LiveQueryResult<Vec<Document>> {
        let event = live_event(query)?;
        let mut pipeline = vec![doc! { "$match": event_stage(event) }];

        let filter = self
            .executor
            .translator()
            .translate_filter(&query.filter)
            .map_err(QueryError::from)?;
        if !filter.is_empty() {
            pipeline.push(doc! { "$match": address_envelope(&filter, FULL_DOCUMENT) });
        }
        Ok(pipeline)
    }

    /// Install a change feed for a descriptor
    pub async fn open(&self, query: DocumentQuery) -> LiveQueryResult<LiveFeed> {
        let event = live_event(&query)?;
        let pipeline = self.feed_pipeline(&query)?;
        let plan = ResultPlan::from_query(&query)?;

        let stream = self
            .executor
            .store()
            .watch(alias::to_internal(&query.collection), pipeline)
            .await?;

        info!(
            collection = %query.collection,
            event = event.as_str(),
            "live query feed opened"
        );

        Ok(LiveFeed {
            executor: Arc::clone(&self.executor),
            collection: query.collection,
            event,
            plan,
            stream: Some(stream),
            state: ServerState::Watching,
        })
    }
}

fn live_event(query: &DocumentQuery) -> LiveQueryResult<LiveEvent> {
    query.event.ok_or_else(|| {
        QueryError::InvalidQuery("live query requires an event".to_string()).into()
    })
}

fn event_stage(event: LiveEvent) -> Document {
    let marker = format!("{}.{}", FULL_DOCUMENT, SOFT_DELETE_FIELD);
    let mut stage = Document::new();
    match event {
        LiveEvent::Insert => {
            stage.insert("operationType", OperationType::Insert.as_str());
        }
        LiveEvent::Replace => {
            stage.insert("operationType", OperationType::Replace.as_str());
        }
        LiveEvent::Update => {
            stage.insert("operationType", OperationType::Update.as_str());
            stage.insert(marker, doc! { "$exists": false });
        }
        LiveEvent::Delete => {
            stage.insert("operationType", OperationType::Update.as_str());
            stage.insert(marker, doc! { "$exists": true });
        }
    }
    stage
}

/// One open subscription feed
pub struct LiveFeed {
    executor: Arc<QueryExecutor>,
    collection: String,
    event: LiveEvent,
    plan: ResultPlan,
    stream: Option<ChangeStream>,
    state: ServerState,
}

impl LiveFeed {
    /// Current server-side state
    pub fn state(&self) -> ServerState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// Subscribed event
    pub fn event(&self) -> LiveEvent {
        self.event
    }

    fn transition(&mut self, event: ServerEvent) {
        if let Some(next) = self.state.next(event) {
            self.state = next;
        }
    }

    fn fail(&mut self) {
        self.stream = None;
        self.transition(ServerEvent::FeedFailed);
    }

    /// Next message for the subscriber. `None` once the feed has ended or
    /// was closed; an error also ends the feed.
    pub async fn next_message(&mut self) -> Option<LiveQueryResult<LiveMessage>> {
        loop {
            let stream = self.stream.as_mut()?;
            let change = match stream.next().await {
                Some(Ok(change)) => change,
                Some(Err(e)) => {
                    error!(collection = %self.collection, error = %e, "live query feed failed");
                    self.fail();
                    return Some(Err(LiveQueryError::Store(e)));
                }
                None => {
                    info!(collection = %self.collection, "live query feed ended");
                    self.fail();
                    return None;
                }
            };

            if change.operation_type == OperationType::Invalidate {
                info!(collection = %self.collection, "live query feed invalidated");
                self.fail();
                return None;
            }

            self.transition(ServerEvent::ChangeReceived);
            if !self.qualifies(&change) {
                debug!(
                    collection = %self.collection,
                    operation = change.operation_type.as_str(),
                    "change skipped"
                );
                self.transition(ServerEvent::Skipped);
                continue;
            }
            self.transition(ServerEvent::Qualified);

            return match self.render(&change).await {
                Ok(message) => {
                    self.transition(ServerEvent::Emitted);
                    Some(Ok(message))
                }
                Err(e) => {
                    error!(collection = %self.collection, error = %e, "failed to shape change");
                    self.fail();
                    Some(Err(e.into()))
                }
            };
        }
    }

    fn qualifies(&self, change: &ChangeEvent) -> bool {
        let marked = change
            .full_document
            .as_ref()
            .is_some_and(|doc| doc.contains_key(SOFT_DELETE_FIELD));

        match self.event {
            LiveEvent::Insert => change.operation_type == OperationType::Insert,
            LiveEvent::Replace => change.operation_type == OperationType::Replace,
            LiveEvent::Update => change.operation_type == OperationType::Update && !marked,
            LiveEvent::Delete => change.operation_type == OperationType::Update && marked,
        }
    }

    async fn render(&mut self, change: &ChangeEvent) -> QueryResult<LiveMessage> {
        let Some(full) = &change.full_document else {
            return Ok(LiveMessage::envelope(document_to_json(&change.envelope())));
        };
        let doc = self.executor.present_document(full, &self.plan).await?;

        match (&change.update_description, self.event) {
            (Some(description), LiveEvent::Update) => {
                let mut updated = portable_document(&description.updated_fields);
                finalize(&mut updated);
                let removed = description
                    .removed_fields
                    .iter()
                    .map(|f| to_portable(f))
                    .filter(|f| !f.starts_with('_'))
                    .map(str::to_string)
                    .collect();
                let truncated: Vec<Value> = description
                    .truncated_arrays
                    .iter()
                    .map(document_to_json)
                    .collect();
                Ok(LiveMessage::diff(doc, updated, removed, truncated))
            }
            _ => Ok(LiveMessage::document(doc)),
        }
    }

    /// Release the feed. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        self.stream = None;
        self.transition(ServerEvent::Disconnected);
        info!(collection = %self.collection, "live query feed released");
    }
}
