//! # Hooks
//!
//! Per-collection collaborators invoked around mutations. Hooks are
//! registered once at startup, keyed by external collection name and
//! [`HookEvent`], and called through one signature returning a tagged
//! [`HookOutcome`].
//!
//! - Before hooks may proceed, replace the payload, or veto the operation.
//!   A veto skips the operation without an error.
//! - After hooks run detached; their failures are logged only.
//! - An unregistered hook is a pass-through.

pub mod errors;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, RwLock};

use futures_util::future::{BoxFuture, FutureExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::warn;

pub use errors::{HookError, HookResult};

use crate::query::{DocumentQuery, ExecutionContext, Method};

/// Point in a mutation at which a hook runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookEvent {
    BeforeSave,
    AfterSave,
    BeforeDelete,
    AfterDelete,
}

impl HookEvent {
    /// Whether the hook runs before the store call
    pub fn is_before(&self) -> bool {
        matches!(self, HookEvent::BeforeSave | HookEvent::BeforeDelete)
    }

    /// Event name
    pub fn as_str(&self) -> &'static str {
        match self {
            HookEvent::BeforeSave => "beforeSave",
            HookEvent::AfterSave => "afterSave",
            HookEvent::BeforeDelete => "beforeDelete",
            HookEvent::AfterDelete => "afterDelete",
        }
    }
}

/// Document(s) a mutation writes
#[derive(Debug, Clone, PartialEq)]
pub enum HookPayload {
    Doc(Value),
    Docs(Vec<Value>),
}

/// What a before hook decided
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    /// Run the operation unchanged
    Proceed,
    /// Run the operation with this payload instead
    Replace(HookPayload),
    /// Skip the operation
    Veto,
}

/// Everything a hook sees about the mutation
#[derive(Debug, Clone)]
pub struct HookContext {
    pub event: HookEvent,
    pub collection: String,
    pub method: Method,
    /// Stored document before the mutation, when there is one
    pub before: Option<Value>,
    /// Document as it will look (before hooks) or looks (after hooks)
    pub after: Option<Value>,
    pub payload: Option<HookPayload>,
    pub query: DocumentQuery,
    pub context: ExecutionContext,
}

/// Future returned by a hook
pub type HookFuture = BoxFuture<'static, HookResult<HookOutcome>>;

/// A registered hook
pub type Hook = Arc<dyn Fn(HookContext) -> HookFuture + Send + Sync>;

/// Hooks keyed by collection and event
#[derive(Default)]
pub struct HookRegistry {
    hooks: RwLock<HashMap<(String, HookEvent), Hook>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registered: Vec<String> = self
            .hooks
            .read()
            .map(|h| {
                h.keys()
                    .map(|(collection, event)| format!("{}:{}", collection, event.as_str()))
                    .collect()
            })
            .unwrap_or_default();
        f.debug_struct("HookRegistry")
            .field("registered", &registered)
            .finish()
    }
}

impl HookRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a hook, replacing any previous one for the same slot
    pub fn register<F, Fut>(&self, collection: impl Into<String>, event: HookEvent, hook: F)
    where
        F: Fn(HookContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult<HookOutcome>> + Send + 'static,
    {
        let hook: Hook = Arc::new(move |ctx| hook(ctx).boxed());
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.insert((collection.into(), event), hook);
        }
    }

    /// Remove a hook. Returns whether one was registered.
    pub fn unregister(&self, collection: &str, event: HookEvent) -> bool {
        self.hooks
            .write()
            .map(|mut hooks| hooks.remove(&(collection.to_string(), event)).is_some())
            .unwrap_or(false)
    }

    /// Look up a hook
    pub fn get(&self, collection: &str, event: HookEvent) -> Option<Hook> {
        self.hooks
            .read()
            .ok()?
            .get(&(collection.to_string(), event))
            .cloned()
    }

    /// Whether a hook is registered
    pub fn has(&self, collection: &str, event: HookEvent) -> bool {
        self.get(collection, event).is_some()
    }

    /// Run a before hook. No hook means proceed.
    pub async fn run_before(&self, ctx: HookContext) -> HookResult<HookOutcome> {
        match self.get(&ctx.collection, ctx.event) {
            Some(hook) => hook(ctx).await,
            None => Ok(HookOutcome::Proceed),
        }
    }

    /// Spawn an after hook. Its outcome is ignored and failures are logged.
    pub fn spawn_after(&self, ctx: HookContext) -> Option<JoinHandle<()>> {
        let hook = self.get(&ctx.collection, ctx.event)?;
        Some(tokio::spawn(async move {
            let collection = ctx.collection.clone();
            let event = ctx.event.as_str();
            if let Err(e) = hook(ctx).await {
                warn!(collection = %collection, hook = event, error = %e, "after hook failed");
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn context(event: HookEvent) -> HookContext {
        HookContext {
            event,
            collection: "Post".into(),
            method: Method::Insert,
            before: None,
            after: Some(json!({"title": "t"})),
            payload: Some(HookPayload::Doc(json!({"title": "t"}))),
            query: DocumentQuery::new("Post"),
            context: ExecutionContext::Server,
        }
    }

    #[tokio::test]
    async fn test_missing_hook_proceeds() {
        let registry = HookRegistry::new();
        let outcome = registry.run_before(context(HookEvent::BeforeSave)).await.unwrap();
        assert_eq!(outcome, HookOutcome::Proceed);
        assert!(registry.spawn_after(context(HookEvent::AfterSave)).is_none());
    }

    #[tokio::test]
    async fn test_before_hook_can_replace_and_veto() {
        let registry = HookRegistry::new();
        registry.register("Post", HookEvent::BeforeSave, |ctx: HookContext| async move {
            match ctx.after.as_ref().and_then(|a| a.get("title")) {
                Some(title) if title == "t" => Ok(HookOutcome::Replace(HookPayload::Doc(
                    json!({"title": "T"}),
                ))),
                _ => Ok(HookOutcome::Veto),
            }
        });

        let outcome = registry.run_before(context(HookEvent::BeforeSave)).await.unwrap();
        assert_eq!(
            outcome,
            HookOutcome::Replace(HookPayload::Doc(json!({"title": "T"})))
        );

        let mut ctx = context(HookEvent::BeforeSave);
        ctx.after = None;
        assert_eq!(registry.run_before(ctx).await.unwrap(), HookOutcome::Veto);
    }

    #[tokio::test]
    async fn test_after_hook_failure_is_contained() {
        let registry = HookRegistry::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        registry.register("Post", HookEvent::AfterSave, move |_ctx: HookContext| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(HookError::Failed("boom".into()))
            }
        });

        let handle = registry.spawn_after(context(HookEvent::AfterSave)).unwrap();
        handle.await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unregister() {
        let registry = HookRegistry::new();
        registry.register("Post", HookEvent::BeforeDelete, |_ctx: HookContext| async {
            Ok(HookOutcome::Proceed)
        });
        assert!(registry.has("Post", HookEvent::BeforeDelete));
        assert!(registry.unregister("Post", HookEvent::BeforeDelete));
        assert!(!registry.has("Post", HookEvent::BeforeDelete));
    }
}
