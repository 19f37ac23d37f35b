//! Exact in-memory vector search.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{cosine_similarity, sort_hits, validate_vector, VectorFilter, VectorIndex, VectorMetadata};
use crate::error::Result;
use crate::sync::{read, write};

struct Entry {
    vector: Vec<f32>,
    metadata: VectorMetadata,
}

/// Brute-force cosine search over every stored vector.
pub struct FlatIndex {
    dimensions: usize,
    entries: RwLock<HashMap<String, Entry>>,
}

impl FlatIndex {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions,
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl VectorIndex for FlatIndex {
    fn backend(&self) -> &'static str {
        "flat"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn upsert(&self, id: &str, vector: &[f32], metadata: VectorMetadata) -> Result<()> {
        validate_vector(vector, self.dimensions)?;
        write(&self.entries).insert(
            id.to_string(),
            Entry {
                vector: vector.to_vec(),
                metadata,
            },
        );
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize, filter: &VectorFilter) -> Result<Vec<(String, f64)>> {
        validate_vector(vector, self.dimensions)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let entries = read(&self.entries);
        let mut hits: Vec<(String, f64)> = entries
            .iter()
            .filter(|(_, e)| filter.matches(&e.metadata))
            .map(|(id, e)| (id.clone(), cosine_similarity(vector, &e.vector)))
            .collect();
        sort_hits(&mut hits, k);
        Ok(hits)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        Ok(write(&self.entries).remove(id).is_some())
    }

    fn get(&self, id: &str) -> Result<Option<Vec<f32>>> {
        Ok(read(&self.entries).get(id).map(|e| e.vector.clone()))
    }

    fn len(&self) -> Result<usize> {
        Ok(read(&self.entries).len())
    }
}
