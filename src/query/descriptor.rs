//! # Query Descriptor
//!
//! The portable query shape. It is both the request body the executor
//! receives and the live-query handshake payload.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Operation a descriptor runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Method {
    Find,
    FindOne,
    Get,
    Insert,
    InsertMany,
    Update,
    UpdateMany,
    Upsert,
    UpsertMany,
    Delete,
    DeleteMany,
    Count,
    Aggregate,
}

impl Method {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Find => "find",
            Method::FindOne => "findOne",
            Method::Get => "get",
            Method::Insert => "insert",
            Method::InsertMany => "insertMany",
            Method::Update => "update",
            Method::UpdateMany => "updateMany",
            Method::Upsert => "upsert",
            Method::UpsertMany => "upsertMany",
            Method::Delete => "delete",
            Method::DeleteMany => "deleteMany",
            Method::Count => "count",
            Method::Aggregate => "aggregate",
        }
    }

    /// Whether the method writes
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Method::Insert
                | Method::InsertMany
                | Method::Update
                | Method::UpdateMany
                | Method::Upsert
                | Method::UpsertMany
                | Method::Delete
                | Method::DeleteMany
        )
    }

    /// Whether the method selects its targets with a filter it cannot run
    /// without
    pub fn requires_filter(&self) -> bool {
        self.is_mutation() && !matches!(self, Method::Insert | Method::InsertMany)
    }

    /// Whether the method marks documents deleted
    pub fn is_delete(&self) -> bool {
        matches!(self, Method::Delete | Method::DeleteMany)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Change kind a live query subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiveEvent {
    Insert,
    Update,
    Replace,
    Delete,
}

impl LiveEvent {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            LiveEvent::Insert => "insert",
            LiveEvent::Update => "update",
            LiveEvent::Replace => "replace",
            LiveEvent::Delete => "delete",
        }
    }
}

/// Execution options
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryOptions {
    /// Insert when an update matches nothing
    #[serde(default)]
    pub upsert: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// Portable query descriptor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentQuery {
    pub collection: String,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub filter: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub projection: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub sort: Map<String, Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<u64>,

    /// Dotted pointer paths to resolve
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<String>,

    /// Dotted paths removed after resolution
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipeline: Vec<Value>,

    #[serde(default)]
    pub options: QueryOptions,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<Method>,

    /// Live-query event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<LiveEvent>,

    /// Elevated mode
    #[serde(default, skip_serializing_if = "is_false")]
    pub unlock: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,

    /// Single-document payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc: Option<Value>,

    /// Multi-document payload
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub docs: Vec<Value>,
}

impl DocumentQuery {
    /// Empty descriptor for a collection
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            ..Self::default()
        }
    }

    /// Whether any modifier that shapes a by-id read was set
    pub fn has_read_modifiers(&self) -> bool {
        !self.filter.is_empty()
            || !self.projection.is_empty()
            || !self.include.is_empty()
            || !self.exclude.is_empty()
            || !self.pipeline.is_empty()
    }

    /// Effective upsert flag
    pub fn upserts(&self) -> bool {
        self.options.upsert || matches!(self.method, Some(Method::Upsert | Method::UpsertMany))
    }
}
