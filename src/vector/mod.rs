//! Nearest-neighbor search over precomputed vectors.
//!
//! [`VectorIndex`] is the seam between retrieval and whatever holds the
//! vectors. Two backends ship: [`flat::FlatIndex`] (exact, in-memory) and
//! [`sqlite::SqliteVecIndex`] (persistent `vec0` table). Both report cosine
//! similarity, so fusion and reranking never depend on which one is in use.

pub mod flat;
pub mod sqlite;

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::{MnemaConfig, VectorBackend};
use crate::error::{MemoryError, Result};
use crate::memory::types::Scope;

pub use flat::FlatIndex;
pub use sqlite::SqliteVecIndex;

/// Attributes stored alongside a vector for filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub owner: String,
    pub scope: Scope,
    pub tags: Vec<String>,
}

/// Restrictions applied to vector candidates.
#[derive(Debug, Clone)]
pub struct VectorFilter {
    pub owner: String,
    pub scope: Option<Scope>,
    /// Every listed tag must be present.
    pub tags: Vec<String>,
}

impl VectorFilter {
    pub fn owner(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            scope: None,
            tags: Vec::new(),
        }
    }

    pub fn matches(&self, meta: &VectorMetadata) -> bool {
        meta.owner == self.owner
            && self.scope.map_or(true, |s| s == meta.scope)
            && self.tags.iter().all(|t| meta.tags.contains(t))
    }
}

/// Trait for vector stores.
///
/// Methods are synchronous; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait VectorIndex: Send + Sync {
    /// Short backend name for logs and stats.
    fn backend(&self) -> &'static str;

    fn dimensions(&self) -> usize;

    /// Insert or replace the vector for `id`.
    fn upsert(&self, id: &str, vector: &[f32], metadata: VectorMetadata) -> Result<()>;

    /// Up to `k` `(id, cosine similarity)` pairs, most similar first, ties by id.
    fn query(&self, vector: &[f32], k: usize, filter: &VectorFilter) -> Result<Vec<(String, f64)>>;

    /// Remove `id`. Returns `false` when it was not indexed.
    fn delete(&self, id: &str) -> Result<bool>;

    /// Stored vector for `id`, if any.
    fn get(&self, id: &str) -> Result<Option<Vec<f32>>>;

    fn len(&self) -> Result<usize>;

    /// Version of the underlying engine, when it reports one.
    fn version(&self) -> Option<String> {
        None
    }

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Open the backend selected by configuration.
pub fn open_vector_index(config: &MnemaConfig) -> Result<Arc<dyn VectorIndex>> {
    let dims = config.vector.dimensions;
    match config.vector.backend {
        VectorBackend::Flat => Ok(Arc::new(FlatIndex::new(dims))),
        VectorBackend::SqliteVec => {
            let index = SqliteVecIndex::open(config.resolved_vector_db_path(), dims)?;
            Ok(Arc::new(index))
        }
    }
}

/// Reject vectors of the wrong dimension, with non-finite components, or of zero length.
pub fn validate_vector(vector: &[f32], dimensions: usize) -> Result<()> {
    if vector.len() != dimensions {
        return Err(MemoryError::validation(format!(
            "vector has {} dimensions, expected {dimensions}",
            vector.len()
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(MemoryError::validation("vector contains non-finite values"));
    }
    if l2_norm(vector) == 0.0 {
        return Err(MemoryError::validation("vector has zero magnitude"));
    }
    Ok(())
}

pub fn l2_norm(vector: &[f32]) -> f64 {
    vector.iter().map(|v| f64::from(*v) * f64::from(*v)).sum::<f64>().sqrt()
}

/// Scale to unit length. Zero vectors are returned unchanged.
pub fn normalize(vector: &[f32]) -> Vec<f32> {
    let norm = l2_norm(vector);
    if norm == 0.0 {
        return vector.to_vec();
    }
    vector.iter().map(|v| (f64::from(*v) / norm) as f32).collect()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    let dot: f64 = a.iter().zip(b).map(|(x, y)| f64::from(*x) * f64::from(*y)).sum();
    let denom = l2_norm(a) * l2_norm(b);
    if denom == 0.0 {
        0.0
    } else {
        dot / denom
    }
}

/// Convert an f32 vector slice to raw bytes for sqlite-vec.
pub fn embedding_to_bytes(embedding: &[f32]) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(
            embedding.as_ptr() as *const u8,
            std::mem::size_of_val(embedding),
        )
    }
}

pub fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

pub(crate) fn sort_hits(hits: &mut Vec<(String, f64)>, k: usize) {
    hits.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    hits.truncate(k);
}
