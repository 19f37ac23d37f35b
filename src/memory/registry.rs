//! Name-based dispatch over [`MemoryManager`] operations.
//!
//! Front-ends that receive operations by name (a tool-calling transport, an
//! RPC bridge) build one [`OperationRegistry`] and pass it by reference. Every
//! handler parses its JSON parameters into a typed request, calls the manager
//! and serializes the result.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::graph::NewNode;
use super::manager::{MemoryManager, SearchRequest, StoreRequest};
use super::store::{ListFilter, PageRequest};
use super::types::{FeedbackLabel, NodeType, Scope};
use crate::error::{MemoryError, Result};

pub type OperationFuture<'a> = BoxFuture<'a, Result<serde_json::Value>>;
pub type Handler = for<'a> fn(&'a MemoryManager, serde_json::Value) -> OperationFuture<'a>;

pub struct OperationRegistry {
    handlers: BTreeMap<&'static str, Handler>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            handlers: BTreeMap::new(),
        };
        registry.register("store", store);
        registry.register("recall_key", recall_key);
        registry.register("recall", recall);
        registry.register("search", search);
        registry.register("forget", forget);
        registry.register("list", list);
        registry.register("link", link);
        registry.register("unlink", unlink);
        registry.register("add_node", add_node);
        registry.register("query_graph", query_graph);
        registry.register("record_feedback", record_feedback);
        registry.register("get_pattern", get_pattern);
        registry.register("prune_sessions", prune_sessions);
        registry.register("purge_orphaned_edges", purge_orphaned_edges);
        registry.register("stats", stats);
        registry.register("flush", flush);
        registry
    }

    /// Add or replace a handler.
    pub fn register(&mut self, name: &'static str, handler: Handler) {
        self.handlers.insert(name, handler);
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.handlers.keys().copied()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Run the operation called `name`.
    pub async fn dispatch(
        &self,
        manager: &MemoryManager,
        name: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let handler = self
            .handlers
            .get(name)
            .ok_or_else(|| MemoryError::validation(format!("unknown operation: {name}")))?;
        tracing::debug!(operation = name, "dispatching");
        handler(manager, params).await
    }
}

impl Default for OperationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── Parameters ───────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct KeyParams {
    owner: String,
    scope: Scope,
    key: String,
}

#[derive(Deserialize)]
struct RecallParams {
    owner: String,
    query: String,
    #[serde(default)]
    vector: Option<Vec<f32>>,
    #[serde(default)]
    k: Option<usize>,
    #[serde(default)]
    scope: Option<Scope>,
}

#[derive(Deserialize)]
struct ListParams {
    owner: String,
    #[serde(default)]
    scope: Option<Scope>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    min_importance: Option<f64>,
    #[serde(default)]
    key_prefix: Option<String>,
    #[serde(default)]
    offset: Option<usize>,
    #[serde(default)]
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct LinkParams {
    src: String,
    dst: String,
    rel_type: String,
    #[serde(default = "default_weight")]
    weight: f64,
}

fn default_weight() -> f64 {
    1.0
}

#[derive(Deserialize)]
struct UnlinkParams {
    src: String,
    dst: String,
    rel_type: String,
}

#[derive(Deserialize)]
struct AddNodeParams {
    #[serde(default)]
    id: Option<String>,
    owner: String,
    #[serde(rename = "type")]
    node_type: NodeType,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct QueryGraphParams {
    seeds: Vec<String>,
    #[serde(default = "default_depth")]
    depth: usize,
    #[serde(default)]
    rel_type: Option<String>,
}

fn default_depth() -> usize {
    2
}

#[derive(Deserialize)]
struct FeedbackParams {
    owner: String,
    scope: Scope,
    key: String,
    label: FeedbackLabel,
    #[serde(default = "default_weight")]
    weight: f64,
}

#[derive(Deserialize)]
struct OwnerParams {
    owner: String,
}

#[derive(Deserialize, Default)]
struct OptionalOwnerParams {
    #[serde(default)]
    owner: Option<String>,
}

#[derive(Deserialize)]
struct PruneParams {
    older_than: DateTime<Utc>,
}

fn parse<T: DeserializeOwned>(params: serde_json::Value) -> Result<T> {
    serde_json::from_value(params).map_err(|e| MemoryError::validation(format!("invalid parameters: {e}")))
}

/// `null` parameters mean "all defaults".
fn parse_or_default<T: DeserializeOwned + Default>(params: serde_json::Value) -> Result<T> {
    if params.is_null() {
        Ok(T::default())
    } else {
        parse(params)
    }
}

fn respond<T: Serialize>(value: T) -> Result<serde_json::Value> {
    Ok(serde_json::to_value(value)?)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

fn store(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let request: StoreRequest = parse(params)?;
        respond(m.store(request).await?)
    })
}

fn recall_key(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: KeyParams = parse(params)?;
        respond(m.recall_key(&p.owner, p.scope, &p.key).await?)
    })
}

fn recall(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: RecallParams = parse(params)?;
        respond(m.recall(&p.owner, &p.query, p.vector, p.k, p.scope).await?)
    })
}

fn search(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let request: SearchRequest = parse(params)?;
        respond(m.search(request).await?)
    })
}

fn forget(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: KeyParams = parse(params)?;
        respond(m.forget(&p.owner, p.scope, &p.key).await?)
    })
}

fn list(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: ListParams = parse(params)?;
        let filter = ListFilter {
            tags: p.tags,
            min_importance: p.min_importance,
            key_prefix: p.key_prefix,
        };
        let defaults = PageRequest::default();
        let page = PageRequest {
            offset: p.offset.unwrap_or(defaults.offset),
            limit: p.limit.unwrap_or(defaults.limit),
        };
        respond(m.list(&p.owner, p.scope, filter, page).await?)
    })
}

fn link(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: LinkParams = parse(params)?;
        respond(m.link(&p.src, &p.dst, &p.rel_type, p.weight).await?)
    })
}

fn unlink(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: UnlinkParams = parse(params)?;
        let removed = m.unlink(&p.src, &p.dst, &p.rel_type).await?;
        respond(serde_json::json!({ "removed": removed }))
    })
}

fn add_node(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: AddNodeParams = parse(params)?;
        let node = NewNode {
            id: p.id,
            owner: p.owner,
            node_type: p.node_type,
            data: p.data.unwrap_or_else(|| serde_json::json!({})),
        };
        respond(m.add_node(node).await?)
    })
}

fn query_graph(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: QueryGraphParams = parse(params)?;
        respond(m.query_graph(&p.seeds, p.depth, p.rel_type.as_deref()).await?)
    })
}

fn record_feedback(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: FeedbackParams = parse(params)?;
        respond(m.record_feedback(&p.owner, p.scope, &p.key, p.label, p.weight).await?)
    })
}

fn get_pattern(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: OwnerParams = parse(params)?;
        respond(m.get_pattern(&p.owner).await?)
    })
}

fn prune_sessions(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: PruneParams = parse(params)?;
        respond(m.prune_sessions(p.older_than).await?)
    })
}

fn purge_orphaned_edges(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: OptionalOwnerParams = parse_or_default(params)?;
        let removed = m.purge_orphaned_edges(p.owner.as_deref()).await?;
        respond(serde_json::json!({ "removed": removed }))
    })
}

fn stats(m: &MemoryManager, params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        let p: OptionalOwnerParams = parse_or_default(params)?;
        respond(m.stats(p.owner.as_deref()).await?)
    })
}

fn flush(m: &MemoryManager, _params: serde_json::Value) -> OperationFuture<'_> {
    Box::pin(async move {
        m.flush().await?;
        respond(serde_json::json!({ "flushed": true }))
    })
}
