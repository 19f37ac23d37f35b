//! Boundary to whatever turns text into vectors.
//!
//! The engine never generates vectors itself: callers pass precomputed
//! vectors to `store` and `search`. An [`EmbeddingProvider`] is only consulted
//! by index rebuilds, to fill in vectors for records that were stored
//! without one.

use crate::error::Result;

/// Trait for embedding text into vectors.
///
/// All methods are synchronous; callers in async contexts use
/// `tokio::task::spawn_blocking`.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text string into a vector.
    fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Number of dimensions this provider produces.
    fn dimensions(&self) -> usize;
}
