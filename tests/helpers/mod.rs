#![allow(dead_code)]

use mnema::config::{MnemaConfig, VectorBackend};
use mnema::memory::types::{MemoryRecord, Scope};
use mnema::memory::{MemoryManager, StoreRequest};
use rusqlite::Connection;
use std::path::Path;

/// Vector width used throughout the integration tests.
pub const DIMS: usize = 8;

/// Default config with small vectors.
pub fn test_config() -> MnemaConfig {
    let mut config = MnemaConfig::default();
    config.vector.dimensions = DIMS;
    config
}

/// Config pointing both databases into `dir`, using the persistent vector backend.
pub fn file_config(dir: &Path) -> MnemaConfig {
    let mut config = test_config();
    config.storage.db_path = dir.join("memory.db").to_string_lossy().into_owned();
    config.storage.vector_db_path = dir.join("vectors.db").to_string_lossy().into_owned();
    config.vector.backend = VectorBackend::SqliteVec;
    config
}

/// In-memory engine with the flat vector backend.
pub async fn test_manager() -> MemoryManager {
    MemoryManager::open_in_memory(test_config()).await.unwrap()
}

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    mnema::db::open_memory_database().unwrap()
}

/// Deterministic embedding with a spike at position `seed`.
/// Distinct seeds give orthogonal vectors.
pub fn test_embedding(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIMS];
    v[seed % DIMS] = 1.0;
    v
}

/// An embedding close to `base`, leaning slightly toward dimension `toward`.
pub fn similar_embedding(base: &[f32], toward: usize) -> Vec<f32> {
    let mut v = base.to_vec();
    v[toward % DIMS] += 0.2;
    v
}

/// Store a persistent record and return it.
pub async fn put(
    manager: &MemoryManager,
    owner: &str,
    key: &str,
    value: &str,
    vector: Option<Vec<f32>>,
) -> MemoryRecord {
    let mut request = StoreRequest::new(owner, Scope::Persistent, key, value);
    request.vector = vector;
    manager.store(request).await.unwrap()
}
