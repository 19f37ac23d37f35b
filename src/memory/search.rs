//! First-stage hybrid retrieval.
//!
//! The lexical (BM25) and vector sources are queried in parallel for one
//! owner and merged with weighted Reciprocal Rank Fusion. Callers that drop
//! candidates after fusion can ask for a wider pool.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::memory::lexical::{LexicalFilter, LexicalIndex};
use crate::memory::types::Scope;
use crate::vector::{VectorFilter, VectorIndex};

// ── Public types ──────────────────────────────────────────────────────────────

/// Fusion knobs (see `[retrieval]` in the config file).
#[derive(Debug, Clone)]
pub struct FusionParams {
    pub rrf_k: usize,
    pub lexical_weight: f64,
    pub semantic_weight: f64,
    pub lexical_candidates: usize,
    pub semantic_candidates: usize,
    pub fused_candidates: usize,
}

impl Default for FusionParams {
    fn default() -> Self {
        Self {
            rrf_k: 60,
            lexical_weight: 1.0,
            semantic_weight: 1.0,
            lexical_candidates: 20,
            semantic_candidates: 20,
            fused_candidates: 20,
        }
    }
}

impl From<&crate::config::RetrievalConfig> for FusionParams {
    fn from(config: &crate::config::RetrievalConfig) -> Self {
        Self {
            rrf_k: config.rrf_k,
            lexical_weight: config.lexical_weight,
            semantic_weight: config.semantic_weight,
            lexical_candidates: config.lexical_candidates,
            semantic_candidates: config.semantic_candidates,
            fused_candidates: config.fused_candidates,
        }
    }
}

/// A first-stage candidate with its provenance in each source list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedCandidate {
    pub id: String,
    pub fused_score: f64,
    /// 1-indexed rank in the lexical list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_score: Option<f64>,
    /// 1-indexed rank in the vector list.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub similarity: Option<f64>,
}

impl FusionParams {
    /// Every candidate budget multiplied by `factor`.
    pub fn widened(&self, factor: usize) -> Self {
        let factor = factor.max(1);
        Self {
            lexical_candidates: self.lexical_candidates.saturating_mul(factor),
            semantic_candidates: self.semantic_candidates.saturating_mul(factor),
            fused_candidates: self.fused_candidates.saturating_mul(factor),
            ..self.clone()
        }
    }
}

/// Fused candidates plus whether a wider search could find more.
#[derive(Debug, Clone, Default)]
pub struct CandidatePool {
    pub candidates: Vec<FusedCandidate>,
    /// Neither source filled its budget and fusion cut nothing.
    pub exhausted: bool,
}

/// One owner's hybrid query.
#[derive(Debug, Clone, Default)]
pub struct HybridQuery {
    pub owner: String,
    pub text: String,
    /// Precomputed query vector; without one only the lexical source contributes.
    pub vector: Option<Vec<f32>>,
    pub scope: Option<Scope>,
    pub tags: Vec<String>,
}

// ── Fusion ────────────────────────────────────────────────────────────────────

/// Weighted Reciprocal Rank Fusion.
///
/// An item at 1-indexed rank `r` in a source contributes `w / (k + r)`;
/// items missing from a source contribute nothing. The result is deduplicated
/// by id, sorted by fused score (ties by id) and cut to `fused_candidates`.
pub fn weighted_rrf(
    lexical: &[(String, f64)],
    semantic: &[(String, f64)],
    params: &FusionParams,
) -> Vec<FusedCandidate> {
    let k = params.rrf_k as f64;
    let mut merged: HashMap<&str, FusedCandidate> = HashMap::new();

    for (idx, (id, score)) in lexical.iter().enumerate() {
        let rank = idx + 1;
        let entry = merged.entry(id.as_str()).or_insert_with(|| empty_candidate(id));
        if entry.lexical_rank.is_none() {
            entry.lexical_rank = Some(rank);
            entry.lexical_score = Some(*score);
            entry.fused_score += params.lexical_weight / (k + rank as f64);
        }
    }

    for (idx, (id, similarity)) in semantic.iter().enumerate() {
        let rank = idx + 1;
        let entry = merged.entry(id.as_str()).or_insert_with(|| empty_candidate(id));
        if entry.semantic_rank.is_none() {
            entry.semantic_rank = Some(rank);
            entry.similarity = Some(*similarity);
            entry.fused_score += params.semantic_weight / (k + rank as f64);
        }
    }

    let mut fused: Vec<FusedCandidate> = merged.into_values().collect();
    fused.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.id.cmp(&b.id))
    });
    fused.truncate(params.fused_candidates);
    fused
}

fn empty_candidate(id: &str) -> FusedCandidate {
    FusedCandidate {
        id: id.to_string(),
        fused_score: 0.0,
        lexical_rank: None,
        lexical_score: None,
        semantic_rank: None,
        similarity: None,
    }
}

// ── Engine ────────────────────────────────────────────────────────────────────

/// First-stage retrieval: lexical and vector candidates fetched in parallel,
/// then fused.
pub struct HybridSearchEngine {
    lexical: Arc<LexicalIndex>,
    vectors: Arc<dyn VectorIndex>,
    params: FusionParams,
}

impl HybridSearchEngine {
    pub fn new(lexical: Arc<LexicalIndex>, vectors: Arc<dyn VectorIndex>, params: FusionParams) -> Self {
        Self {
            lexical,
            vectors,
            params,
        }
    }

    pub fn params(&self) -> &FusionParams {
        &self.params
    }

    pub async fn search(&self, query: &HybridQuery) -> Result<Vec<FusedCandidate>> {
        Ok(self.search_widened(query, 1).await?.candidates)
    }

    /// [`search`](Self::search) with every candidate budget multiplied by `factor`.
    pub async fn search_widened(&self, query: &HybridQuery, factor: usize) -> Result<CandidatePool> {
        let params = self.params.widened(factor);
        let lexical = Arc::clone(&self.lexical);
        let lexical_filter = LexicalFilter {
            scope: query.scope,
            tags: query.tags.clone(),
        };
        let owner = query.owner.clone();
        let text = query.text.clone();
        let lexical_limit = params.lexical_candidates;
        let lexical_task = tokio::task::spawn_blocking(move || {
            lexical.query(&owner, &text, lexical_limit, &lexical_filter)
        });

        let vector_task = query.vector.clone().map(|vector| {
            let vectors = Arc::clone(&self.vectors);
            let filter = VectorFilter {
                owner: query.owner.clone(),
                scope: query.scope,
                tags: query.tags.clone(),
            };
            let limit = params.semantic_candidates;
            tokio::task::spawn_blocking(move || vectors.query(&vector, limit, &filter))
        });

        let (lexical_hits, semantic_hits) = tokio::join!(lexical_task, async {
            match vector_task {
                Some(task) => task.await.map(Some),
                None => Ok(None),
            }
        });
        let lexical_hits = lexical_hits?;
        let semantic_hits = match semantic_hits? {
            Some(hits) => hits?,
            None => Vec::new(),
        };

        tracing::debug!(
            owner = %query.owner,
            factor,
            lexical = lexical_hits.len(),
            semantic = semantic_hits.len(),
            "hybrid candidates"
        );

        let sources_drained =
            lexical_hits.len() < params.lexical_candidates && semantic_hits.len() < params.semantic_candidates;
        let candidates = weighted_rrf(&lexical_hits, &semantic_hits, &params);
        Ok(CandidatePool {
            exhausted: sources_drained && candidates.len() < params.fused_candidates,
            candidates,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::MemoryRecord;
    use crate::vector::{FlatIndex, VectorMetadata};
    use chrono::Utc;

    fn ranked(ids: &[&str]) -> Vec<(String, f64)> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| (id.to_string(), 1.0 / (i as f64 + 1.0)))
            .collect()
    }

    #[test]
    fn rrf_uses_one_indexed_ranks() {
        let fused = weighted_rrf(&ranked(&["a"]), &[], &FusionParams::default());
        assert!((fused[0].fused_score - 1.0 / 61.0).abs() < 1e-12);
        assert_eq!(fused[0].lexical_rank, Some(1));
        assert_eq!(fused[0].semantic_rank, None);
    }

    #[test]
    fn rrf_item_in_both_lists_ranks_first() {
        let fused = weighted_rrf(
            &ranked(&["lex_only", "both"]),
            &ranked(&["sem_only", "both"]),
            &FusionParams::default(),
        );
        assert_eq!(fused[0].id, "both");
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn rrf_top_of_both_beats_top_of_one() {
        let fused = weighted_rrf(
            &ranked(&["x", "y"]),
            &ranked(&["x", "z"]),
            &FusionParams::default(),
        );
        assert_eq!(fused[0].id, "x");
        assert!(fused[0].fused_score > fused[1].fused_score);
    }

    #[test]
    fn rrf_ties_break_by_id_and_truncate() {
        let params = FusionParams {
            fused_candidates: 2,
            ..Default::default()
        };
        let fused = weighted_rrf(&ranked(&["b"]), &ranked(&["a"]), &params);
        assert_eq!(fused[0].id, "a");
        assert_eq!(fused[1].id, "b");

        let many = weighted_rrf(&ranked(&["a", "b", "c", "d"]), &[], &params);
        assert_eq!(many.len(), 2);
    }

    #[test]
    fn rrf_source_weights_apply() {
        let params = FusionParams {
            lexical_weight: 0.0,
            ..Default::default()
        };
        let fused = weighted_rrf(&ranked(&["lex"]), &ranked(&["sem"]), &params);
        assert_eq!(fused[0].id, "sem");
        assert_eq!(fused[1].fused_score, 0.0);
    }

    fn record(id: &str, value: &str) -> MemoryRecord {
        let now = Utc::now();
        MemoryRecord {
            id: id.into(),
            owner: "u".into(),
            scope: Scope::Persistent,
            key: id.into(),
            value: value.into(),
            tags: vec![],
            importance: 0.5,
            metadata: serde_json::json!({}),
            embedding_id: None,
            version: 1,
            access_count: 0,
            last_accessed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn engine_fuses_both_sources() {
        let lexical = Arc::new(LexicalIndex::default());
        let vectors = Arc::new(FlatIndex::new(2));
        lexical.add(&record("m1", "rust ownership rules"));
        lexical.add(&record("m2", "python typing"));
        let meta = VectorMetadata {
            owner: "u".into(),
            scope: Scope::Persistent,
            tags: vec![],
        };
        vectors.upsert("m1", &[1.0, 0.0], meta.clone()).unwrap();
        vectors.upsert("m2", &[0.0, 1.0], meta).unwrap();

        let engine = HybridSearchEngine::new(lexical, vectors, FusionParams::default());
        let hits = engine
            .search(&HybridQuery {
                owner: "u".into(),
                text: "rust".into(),
                vector: Some(vec![1.0, 0.1]),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits[0].id, "m1");
        assert_eq!(hits[0].lexical_rank, Some(1));
        assert_eq!(hits[0].semantic_rank, Some(1));

        let lexical_only = engine
            .search(&HybridQuery {
                owner: "u".into(),
                text: "python".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(lexical_only.len(), 1);
        assert_eq!(lexical_only[0].id, "m2");
    }
    #[tokio::test]
    async fn widened_search_reaches_past_the_first_budget() {
        let lexical = Arc::new(LexicalIndex::default());
        for i in 0..5 {
            lexical.add(&record(&format!("m{i}"), "shared term"));
        }
        let params = FusionParams {
            lexical_candidates: 2,
            semantic_candidates: 2,
            fused_candidates: 2,
            ..Default::default()
        };
        let engine = HybridSearchEngine::new(lexical, Arc::new(FlatIndex::new(2)), params);
        let query = HybridQuery {
            owner: "u".into(),
            text: "shared".into(),
            ..Default::default()
        };

        let narrow = engine.search_widened(&query, 1).await.unwrap();
        assert_eq!(narrow.candidates.len(), 2);
        assert!(!narrow.exhausted);

        let wide = engine.search_widened(&query, 4).await.unwrap();
        assert_eq!(wide.candidates.len(), 5);
        assert!(wide.exhausted);
    }
}
