//! Core type definitions.
//!
//! Defines [`Scope`] (session-local vs persistent), [`MemoryRecord`] (a full
//! record), [`RecordKey`] (the `(owner, scope, key)` identity), [`FeedbackLabel`],
//! and the knowledge-graph types [`GraphNode`], [`GraphEdge`], and [`Subgraph`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{MemoryError, Result};

/// Maximum length of a single tag, in characters.
pub const MAX_TAG_LEN: usize = 64;

/// Lifetime of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Ephemeral, tied to one agent session; eligible for pruning.
    Session,
    /// Durable across sessions; never pruned.
    Persistent,
}

impl Scope {
    /// SQL-compatible string representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Session => "session",
            Self::Persistent => "persistent",
        }
    }
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Scope {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "session" => Ok(Self::Session),
            "persistent" => Ok(Self::Persistent),
            _ => Err(format!("unknown scope: {s}")),
        }
    }
}

/// Identity of a record as callers address it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub owner: String,
    pub scope: Scope,
    pub key: String,
}

impl RecordKey {
    pub fn new(owner: impl Into<String>, scope: Scope, key: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            scope,
            key: key.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.scope, self.key)
    }
}

/// A memory record, matching the `memories` table schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// UUID v7 (time-sortable); the id every index is keyed by.
    pub id: String,
    pub owner: String,
    pub scope: Scope,
    pub key: String,
    /// Opaque payload, typically text.
    pub value: String,
    /// Normalized: sorted, deduplicated, trimmed.
    pub tags: Vec<String>,
    /// Always within `[0.0, 1.0]`.
    pub importance: f64,
    /// Arbitrary JSON object.
    pub metadata: serde_json::Value,
    /// Set once the vector index has accepted this record's vector.
    pub embedding_id: Option<String>,
    /// Starts at 1, incremented by every upsert.
    pub version: u64,
    pub access_count: u64,
    pub last_accessed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl MemoryRecord {
    pub fn record_key(&self) -> RecordKey {
        RecordKey::new(self.owner.clone(), self.scope, self.key.clone())
    }

    /// Text fed to the lexical index.
    pub fn indexable_text(&self) -> String {
        let mut text = String::with_capacity(self.key.len() + self.value.len() + 16);
        text.push_str(&self.key.replace(['_', '-'], " "));
        text.push(' ');
        text.push_str(&self.value);
        for tag in &self.tags {
            text.push(' ');
            text.push_str(tag);
        }
        text
    }

    pub fn has_tags(&self, required: &[String]) -> bool {
        required.iter().all(|t| self.tags.contains(t))
    }
}

/// Explicit caller feedback on a recalled record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackLabel {
    Useful,
    Irrelevant,
    Outdated,
}

impl FeedbackLabel {
    /// `+1` for useful, `-1` otherwise.
    pub fn sign(&self) -> f64 {
        match self {
            Self::Useful => 1.0,
            Self::Irrelevant | Self::Outdated => -1.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Useful => "useful",
            Self::Irrelevant => "irrelevant",
            Self::Outdated => "outdated",
        }
    }
}

impl std::str::FromStr for FeedbackLabel {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "useful" => Ok(Self::Useful),
            "irrelevant" => Ok(Self::Irrelevant),
            "outdated" => Ok(Self::Outdated),
            _ => Err(format!("unknown feedback label: {s}")),
        }
    }
}

/// Kind of a knowledge-graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    User,
    Topic,
    Memory,
    Interaction,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Topic => "topic",
            Self::Memory => "memory",
            Self::Interaction => "interaction",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "user" => Ok(Self::User),
            "topic" => Ok(Self::Topic),
            "memory" => Ok(Self::Memory),
            "interaction" => Ok(Self::Interaction),
            _ => Err(format!("unknown node type: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub owner: String,
    #[serde(rename = "type")]
    pub node_type: NodeType,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A directed, weighted relationship between two nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub id: String,
    pub owner: String,
    pub src: String,
    pub dst: String,
    /// Relationship label (e.g. `"related_to"`, `"depends_on"`, `"learned_from"`).
    pub rel_type: String,
    /// Always within `[0.0, 1.0]`.
    pub weight: f64,
    /// `true` once an endpoint was deleted; orphaned edges are never traversed.
    pub orphaned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A node reached by traversal, with its hop distance from the nearest seed.
#[derive(Debug, Clone, Serialize)]
pub struct ReachedNode {
    pub node: GraphNode,
    pub depth: usize,
}

/// Result of a bounded breadth-first traversal.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Subgraph {
    /// Reachable non-seed nodes in discovery order, each exactly once.
    pub nodes: Vec<ReachedNode>,
    /// Edges walked during traversal, each exactly once.
    pub edges: Vec<GraphEdge>,
}

impl Subgraph {
    pub fn node_ids(&self) -> Vec<&str> {
        self.nodes.iter().map(|n| n.node.id.as_str()).collect()
    }
}

/// Aggregate statistics over one owner's graph.
#[derive(Debug, Clone, Default, Serialize)]
pub struct GraphPattern {
    pub owner: String,
    pub nodes_by_type: BTreeMap<String, u64>,
    /// Topic label → number of live edges touching that topic node.
    pub topic_frequency: BTreeMap<String, u64>,
    /// Relation types sorted by descending edge count.
    pub dominant_relations: Vec<(String, u64)>,
    pub interaction_nodes: u64,
    pub interaction_edges: u64,
    pub orphaned_edges: u64,
}

/// Check a value that must lie in `[0, 1]`.
pub fn validate_unit(name: &str, value: f64) -> Result<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(MemoryError::validation(format!(
            "{name} must be within [0, 1], got {value}"
        )))
    }
}

/// Trim, validate, deduplicate, and sort a tag list.
pub fn normalize_tags<S: AsRef<str>>(tags: &[S]) -> Result<Vec<String>> {
    let mut out: Vec<String> = Vec::with_capacity(tags.len());
    for raw in tags {
        let tag = raw.as_ref().trim();
        if tag.is_empty() {
            return Err(MemoryError::validation("tags must not be empty"));
        }
        if tag.chars().count() > MAX_TAG_LEN {
            return Err(MemoryError::validation(format!(
                "tag exceeds {MAX_TAG_LEN} characters: {tag}"
            )));
        }
        if tag.chars().any(char::is_control) {
            return Err(MemoryError::validation(format!(
                "tag contains control characters: {tag:?}"
            )));
        }
        out.push(tag.to_lowercase());
    }
    out.sort();
    out.dedup();
    Ok(out)
}

/// Identifiers (owner, key, node id, relation type) must be non-empty and printable.
pub fn validate_ident(name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MemoryError::validation(format!("{name} must not be empty")));
    }
    if value.chars().any(char::is_control) {
        return Err(MemoryError::validation(format!(
            "{name} contains control characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_round_trips_through_str() {
        for scope in [Scope::Session, Scope::Persistent] {
            assert_eq!(scope.as_str().parse::<Scope>().unwrap(), scope);
        }
        assert!("global".parse::<Scope>().is_err());
    }

    #[test]
    fn feedback_sign() {
        assert_eq!(FeedbackLabel::Useful.sign(), 1.0);
        assert_eq!(FeedbackLabel::Irrelevant.sign(), -1.0);
        assert_eq!(FeedbackLabel::Outdated.sign(), -1.0);
    }

    #[test]
    fn normalize_tags_dedups_and_sorts() {
        let tags = normalize_tags(&["Python", " rust ", "python"]).unwrap();
        assert_eq!(tags, vec!["python".to_string(), "rust".to_string()]);
    }

    #[test]
    fn normalize_tags_rejects_malformed() {
        assert!(normalize_tags(&[""]).is_err());
        assert!(normalize_tags(&["bad\ntag"]).is_err());
        assert!(normalize_tags(&["x".repeat(MAX_TAG_LEN + 1)]).is_err());
    }

    #[test]
    fn validate_unit_bounds() {
        assert!(validate_unit("importance", 0.0).is_ok());
        assert!(validate_unit("importance", 1.0).is_ok());
        assert!(validate_unit("importance", 1.01).is_err());
        assert!(validate_unit("weight", f64::NAN).is_err());
    }

    #[test]
    fn indexable_text_splits_key_words() {
        let now = Utc::now();
        let record = MemoryRecord {
            id: "id".into(),
            owner: "o".into(),
            scope: Scope::Persistent,
            key: "python_tips".into(),
            value: "Use type hints".into(),
            tags: vec!["python".into()],
            importance: 0.5,
            metadata: serde_json::json!({}),
            embedding_id: None,
            version: 1,
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        };
        assert_eq!(record.indexable_text(), "python tips Use type hints python");
    }
}
