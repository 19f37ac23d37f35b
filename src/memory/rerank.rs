//! Second-stage scoring of fused candidates.
//!
//! Each candidate's final score is a weighted sum of five signals:
//! vector similarity, access activation (`1 − e^(−a)`), stored importance,
//! graph centrality (weighted degree over the batch maximum) and fused
//! first-stage relevance (over the batch maximum). Signals arrive
//! precomputed in batch; the reranker itself is pure.

use serde::Serialize;
use std::collections::HashMap;

use crate::memory::search::FusedCandidate;
use crate::memory::types::MemoryRecord;

#[derive(Debug, Clone, Copy)]
pub struct RerankWeights {
    pub semantic: f64,
    pub activation: f64,
    pub importance: f64,
    pub graph: f64,
    pub relevance: f64,
}

impl Default for RerankWeights {
    fn default() -> Self {
        Self::from(&crate::config::RerankConfig::default())
    }
}

impl From<&crate::config::RerankConfig> for RerankWeights {
    fn from(config: &crate::config::RerankConfig) -> Self {
        Self {
            semantic: config.semantic_weight,
            activation: config.activation_weight,
            importance: config.importance_weight,
            graph: config.graph_weight,
            relevance: config.relevance_weight,
        }
    }
}

/// Per-signal inputs behind a final score, each in `[0, 1]` except `fused`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub semantic: f64,
    pub activation: f64,
    pub importance: f64,
    pub graph: f64,
    pub relevance: f64,
    /// Raw RRF score from the first stage.
    pub fused: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_rank: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub semantic_rank: Option<usize>,
}

/// A fully scored result.
#[derive(Debug, Clone, Serialize)]
pub struct RankedMemory {
    pub record: MemoryRecord,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Batch-fetched signals for one rerank pass.
#[derive(Debug, Default)]
pub struct RerankSignals {
    pub records: HashMap<String, MemoryRecord>,
    /// Raw activation levels.
    pub activations: HashMap<String, f64>,
    /// Weighted degree of each candidate's memory node.
    pub degrees: HashMap<String, f64>,
}

pub struct Reranker {
    weights: RerankWeights,
}

impl Reranker {
    pub fn new(weights: RerankWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> RerankWeights {
        self.weights
    }

    /// Score and sort candidates. Candidates whose record is missing from
    /// `signals.records` (deleted since the first stage) are dropped.
    pub fn rerank(&self, candidates: &[FusedCandidate], signals: &RerankSignals) -> Vec<RankedMemory> {
        let max_fused = candidates.iter().map(|c| c.fused_score).fold(0.0_f64, f64::max);
        let max_degree = candidates
            .iter()
            .filter_map(|c| signals.degrees.get(&c.id))
            .copied()
            .fold(0.0_f64, f64::max);

        let mut ranked: Vec<RankedMemory> = candidates
            .iter()
            .filter_map(|candidate| {
                let record = signals.records.get(&candidate.id)?;
                let activation = signals.activations.get(&candidate.id).copied().unwrap_or(0.0);
                let degree = signals.degrees.get(&candidate.id).copied().unwrap_or(0.0);

                let breakdown = ScoreBreakdown {
                    semantic: candidate.similarity.unwrap_or(0.0).clamp(0.0, 1.0),
                    activation: activation_score(activation),
                    importance: record.importance,
                    graph: if max_degree > 0.0 { degree / max_degree } else { 0.0 },
                    relevance: if max_fused > 0.0 {
                        candidate.fused_score / max_fused
                    } else {
                        0.0
                    },
                    fused: candidate.fused_score,
                    lexical_rank: candidate.lexical_rank,
                    semantic_rank: candidate.semantic_rank,
                };
                Some(RankedMemory {
                    record: record.clone(),
                    score: self.combine(&breakdown),
                    breakdown,
                })
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.record.id.cmp(&b.record.id))
        });
        ranked
    }

    fn combine(&self, b: &ScoreBreakdown) -> f64 {
        let w = &self.weights;
        w.semantic * b.semantic
            + w.activation * b.activation
            + w.importance * b.importance
            + w.graph * b.graph
            + w.relevance * b.relevance
    }
}

impl Default for Reranker {
    fn default() -> Self {
        Self::new(RerankWeights::default())
    }
}

/// Map an unbounded activation level onto `[0, 1)`.
pub fn activation_score(level: f64) -> f64 {
    if level <= 0.0 {
        0.0
    } else {
        1.0 - (-level).exp()
    }
}
