//! Persistent multi-tier memory for AI agents.
//!
//! mnema stores key/value facts per owner and recalls them by keyword and by
//! meaning. Records live in SQLite; around them sit derived structures that
//! are rebuilt or updated in the background:
//!
//! | Tier | Backing | Role |
//! |------|---------|------|
//! | **Records** | SQLite `memories` table | Ground truth, versioned, audit logged |
//! | **Lexical** | In-memory BM25 inverted index | Keyword recall |
//! | **Vectors** | Flat index or [sqlite-vec](https://github.com/asg017/sqlite-vec) | Semantic recall over caller-supplied vectors |
//! | **Graph** | SQLite `graph_nodes` / `graph_edges` | Entities, topics and relationships |
//! | **Activation** | In-memory, per owner | Recency with decay and Hebbian co-activation |
//!
//! # Architecture
//!
//! - **Write path**: [`memory::MemoryManager::store`] commits the record, then
//!   queues it for the index worker
//! - **Read path**: lexical and vector candidates are fused with weighted
//!   Reciprocal Rank Fusion and reranked by similarity, activation, importance
//!   and graph centrality
//! - **Feedback**: explicit labels move a record's importance within `[0, 1]`
//!
//! # Modules
//!
//! - [`config`] - Configuration loading from TOML files and environment variables
//! - [`db`] - SQLite initialization, schema, migrations, and health checks
//! - [`embedding`] - Boundary trait for externally computed vectors
//! - [`error`] - The [`error::MemoryError`] taxonomy
//! - [`memory`] - The engine: store, indexes, graph, activation, ranking, facade
//! - [`vector`] - The [`vector::VectorIndex`] trait and its backends

pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod memory;
pub mod sync;
pub mod vector;

pub use error::{MemoryError, Result};
