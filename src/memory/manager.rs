//! The memory engine facade.
//!
//! [`MemoryManager`] owns every component and runs the write and read flows:
//!
//! - **store**: key lock, durable upsert, then the record is queued for the
//!   background indexer. The call returns once the row is committed.
//! - **search / recall**: lexical and vector candidates fused by RRF, reranked
//!   with activation, importance and graph centrality, then the returned set
//!   is recorded as accessed (activation boost plus Hebbian co-activation).
//! - **forget**: key lock, queue flush, removal from every index, durable delete.
//!
//! All SQLite work runs on `spawn_blocking`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncWrite};

use super::activation::{ActivationEngine, ActivationParams};
use super::feedback::{FeedbackOutcome, FeedbackParams, RecallScorer};
use super::forget::{forget_record, ForgetAck};
use super::graph::{GraphStore, IntegrityReport, LinkOutcome, NewNode};
use super::indexer::{IndexJob, IndexTargets, Indexer, IndexerStats, RetryPolicy};
use super::lexical::{Bm25Params, LexicalIndex};
use super::locks::KeyLocks;
use super::maintenance::{self, PruneReport, RebuildOptions, RebuildReport};
use super::rerank::{RankedMemory, RerankSignals, Reranker, ScoreBreakdown};
use super::search::{FusedCandidate, FusionParams, HybridQuery, HybridSearchEngine};
use super::stats::{self, MemoryStats};
use super::store::{ListFilter, LogEntry, NewRecord, Page, PageRequest, RecordStore, StoreLimits};
use super::transfer::{self, ExportReport, ImportReport, TransferOptions};
use super::types::{
    normalize_tags, validate_ident, FeedbackLabel, GraphNode, GraphPattern, MemoryRecord, RecordKey,
    Scope, Subgraph,
};
use crate::config::{MnemaConfig, VectorBackend};
use crate::db::{migrations, HealthReport};
use crate::error::{MemoryError, Result};
use crate::vector::{open_vector_index, validate_vector, FlatIndex, SqliteVecIndex, VectorIndex};

/// Upper bound on how far a filtered search widens its candidate budgets.
const MAX_WIDENING: usize = 64;

// ── Requests and responses ───────────────────────────────────────────────────

/// Input to [`MemoryManager::store`].
#[derive(Debug, Clone, Deserialize)]
pub struct StoreRequest {
    pub owner: String,
    pub scope: Scope,
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Defaults to 0.5.
    #[serde(default)]
    pub importance: Option<f64>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    /// Precomputed vector for semantic recall.
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    /// Optimistic concurrency check, `0` meaning "must not exist yet".
    #[serde(default)]
    pub expected_version: Option<u64>,
}

impl StoreRequest {
    pub fn new(owner: impl Into<String>, scope: Scope, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            scope,
            key: key.into(),
            value: value.into(),
            tags: Vec::new(),
            importance: None,
            metadata: None,
            vector: None,
            expected_version: None,
        }
    }
}

/// Input to [`MemoryManager::search`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchRequest {
    pub owner: String,
    pub query: String,
    #[serde(default)]
    pub vector: Option<Vec<f32>>,
    #[serde(default)]
    pub scope: Option<Scope>,
    /// Every listed tag must be present.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub min_importance: Option<f64>,
    /// Defaults to `retrieval.default_k`.
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One ranked result.
#[derive(Debug, Clone, Serialize)]
pub struct MemoryHit {
    pub id: String,
    pub scope: Scope,
    pub key: String,
    pub value: String,
    pub score: f64,
    pub metadata: serde_json::Value,
    pub tags: Vec<String>,
    pub importance: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<ScoreBreakdown>,
}

impl MemoryHit {
    fn from_ranked(ranked: RankedMemory, with_breakdown: bool) -> Self {
        let RankedMemory {
            record,
            score,
            breakdown,
        } = ranked;
        Self {
            id: record.id,
            scope: record.scope,
            key: record.key,
            value: record.value,
            score,
            metadata: record.metadata,
            tags: record.tags,
            importance: record.importance,
            breakdown: with_breakdown.then_some(breakdown),
        }
    }
}

/// Aggregate view of one owner's memory.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerPattern {
    pub owner: String,
    pub records: u64,
    pub top_tags: Vec<(String, u64)>,
    pub graph: GraphPattern,
}

#[derive(Debug, Serialize)]
pub struct MemoryHealth {
    pub database: HealthReport,
    pub graph: IntegrityReport,
    pub vector_backend: String,
    pub vector_dimensions: usize,
    pub vectors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vector_version: Option<String>,
    pub indexer: IndexerStats,
}

// ── Manager ──────────────────────────────────────────────────────────────────

pub struct MemoryManager {
    config: MnemaConfig,
    db_path: Option<PathBuf>,
    targets: IndexTargets,
    search: HybridSearchEngine,
    reranker: Reranker,
    scorer: Arc<RecallScorer>,
    indexer: Indexer,
    locks: KeyLocks,
}

impl MemoryManager {
    /// Open the file-backed engine described by `config`.
    pub async fn open(config: MnemaConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MemoryError::validation(e.to_string()))?;
        let db_path = config.resolved_db_path();
        let store = Arc::new(RecordStore::open(&db_path, StoreLimits::from(&config.storage))?);
        let vectors = open_vector_index(&config)?;
        Self::assemble(config, store, vectors, Some(db_path)).await
    }

    /// Engine with an in-memory record store. The vector backend follows
    /// `config.vector.backend`, also in memory.
    pub async fn open_in_memory(config: MnemaConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|e| MemoryError::validation(e.to_string()))?;
        let store = Arc::new(RecordStore::open_in_memory(StoreLimits::from(&config.storage))?);
        let dims = config.vector.dimensions;
        let vectors: Arc<dyn VectorIndex> = match config.vector.backend {
            VectorBackend::Flat => Arc::new(FlatIndex::new(dims)),
            VectorBackend::SqliteVec => Arc::new(SqliteVecIndex::open_in_memory(dims)?),
        };
        Self::assemble(config, store, vectors, None).await
    }

    async fn assemble(
        config: MnemaConfig,
        store: Arc<RecordStore>,
        vectors: Arc<dyn VectorIndex>,
        db_path: Option<PathBuf>,
    ) -> Result<Self> {
        let lexical = Arc::new(LexicalIndex::new(Bm25Params {
            k1: config.retrieval.bm25_k1,
            b: config.retrieval.bm25_b,
        }));
        let graph = Arc::new(GraphStore::new(
            store.writer_handle(),
            store.reader_handle(),
            config.graph.on_node_delete,
        ));
        let activation = Arc::new(ActivationEngine::new(ActivationParams::from(&config.activation)));

        {
            let store = Arc::clone(&store);
            let dims = vectors.dimensions();
            tokio::task::spawn_blocking(move || check_dimensions(&store, dims)).await??;
        }

        let warm = {
            let store = Arc::clone(&store);
            let lexical = Arc::clone(&lexical);
            let page_size = config.indexing.page_size;
            tokio::task::spawn_blocking(move || warm_lexical(&store, &lexical, page_size)).await??
        };

        let targets = IndexTargets {
            store: Arc::clone(&store),
            lexical: Arc::clone(&lexical),
            vectors: Arc::clone(&vectors),
            graph,
            activation: Arc::clone(&activation),
        };
        let scorer = Arc::new(RecallScorer::new(
            store,
            activation,
            FeedbackParams {
                step: config.feedback.step,
                activation_boost: config.activation.feedback_boost,
            },
        ));
        let indexer = Indexer::spawn(
            targets.clone(),
            RetryPolicy::from(&config.indexing),
            config.indexing.queue_capacity,
        );

        tracing::info!(
            records = warm,
            vector_backend = vectors.backend(),
            dimensions = vectors.dimensions(),
            "memory engine ready"
        );

        Ok(Self {
            search: HybridSearchEngine::new(lexical, vectors, FusionParams::from(&config.retrieval)),
            reranker: Reranker::new((&config.rerank).into()),
            scorer,
            indexer,
            locks: KeyLocks::new(),
            targets,
            db_path,
            config,
        })
    }

    pub fn config(&self) -> &MnemaConfig {
        &self.config
    }

    pub fn store_handle(&self) -> &Arc<RecordStore> {
        &self.targets.store
    }

    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.targets.graph
    }

    pub fn activation(&self) -> &Arc<ActivationEngine> {
        &self.targets.activation
    }

    pub fn vectors(&self) -> &Arc<dyn VectorIndex> {
        &self.targets.vectors
    }

    pub fn lexical(&self) -> &Arc<LexicalIndex> {
        &self.targets.lexical
    }

    // ── Records ──────────────────────────────────────────────────────────────

    /// Durably upsert a record, then queue it for indexing.
    pub async fn store(&self, request: StoreRequest) -> Result<MemoryRecord> {
        if let Some(vector) = &request.vector {
            validate_vector(vector, self.targets.vectors.dimensions())?;
        }
        let key = RecordKey::new(request.owner.clone(), request.scope, request.key.clone());
        let _guard = self.locks.acquire(&key).await;

        let new = NewRecord {
            owner: request.owner,
            scope: request.scope,
            key: request.key,
            value: request.value,
            tags: request.tags,
            importance: request.importance.unwrap_or(0.5),
            metadata: request.metadata.unwrap_or_else(|| serde_json::json!({})),
            expected_version: request.expected_version,
            id: None,
        };
        let store = Arc::clone(&self.targets.store);
        let outcome = tokio::task::spawn_blocking(move || store.put(new)).await??;

        self.indexer
            .enqueue(IndexJob::Upsert {
                record: outcome.record.clone(),
                vector: request.vector,
            })
            .await?;

        tracing::debug!(
            id = %outcome.record.id,
            key = %key,
            version = outcome.record.version,
            "record stored"
        );
        Ok(outcome.record)
    }

    /// Exact-key recall. Counts as an access.
    pub async fn recall_key(&self, owner: &str, scope: Scope, key: &str) -> Result<MemoryRecord> {
        let store = Arc::clone(&self.targets.store);
        let (owner_s, key_s) = (owner.to_string(), key.to_string());
        let record = tokio::task::spawn_blocking(move || -> Result<MemoryRecord> {
            let record = store
                .get(&owner_s, scope, &key_s)?
                .ok_or_else(|| MemoryError::not_found(format!("{owner_s}/{scope}/{key_s}")))?;
            store.record_access(&[record.id.as_str()], Utc::now())?;
            Ok(record)
        })
        .await??;
        self.targets.activation.record_access(owner, &record.id, &[]);
        Ok(record)
    }

    /// Ranked recall without score breakdowns.
    pub async fn recall(
        &self,
        owner: &str,
        query: &str,
        vector: Option<Vec<f32>>,
        k: Option<usize>,
        scope: Option<Scope>,
    ) -> Result<Vec<MemoryHit>> {
        let ranked = self
            .rank(SearchRequest {
                owner: owner.to_string(),
                query: query.to_string(),
                vector,
                scope,
                limit: k,
                ..Default::default()
            })
            .await?;
        Ok(ranked.into_iter().map(|r| MemoryHit::from_ranked(r, false)).collect())
    }

    /// Ranked search with per-signal score breakdowns.
    pub async fn search(&self, request: SearchRequest) -> Result<Vec<MemoryHit>> {
        let ranked = self.rank(request).await?;
        Ok(ranked.into_iter().map(|r| MemoryHit::from_ranked(r, true)).collect())
    }

    async fn rank(&self, request: SearchRequest) -> Result<Vec<RankedMemory>> {
        validate_ident("owner", &request.owner)?;
        if let Some(vector) = &request.vector {
            validate_vector(vector, self.targets.vectors.dimensions())?;
        }
        let limit = request.limit.unwrap_or(self.config.retrieval.default_k);
        if limit == 0 {
            return Err(MemoryError::validation("limit must be > 0"));
        }
        let query = HybridQuery {
            owner: request.owner,
            text: request.query,
            vector: request.vector,
            scope: request.scope,
            tags: normalize_tags(&request.tags)?,
        };

        // filters below can drop fused candidates; widen until `limit` survive
        let mut factor = 1;
        let mut ranked = loop {
            let pool = self.search.search_widened(&query, factor).await?;
            let mut ranked = self.rerank_pool(&query, &pool.candidates).await?;
            // records may have changed since they were indexed
            ranked.retain(|r| {
                r.record.owner == query.owner
                    && query.scope.map_or(true, |s| s == r.record.scope)
                    && r.record.has_tags(&query.tags)
                    && request.min_importance.map_or(true, |m| r.record.importance >= m)
            });
            if ranked.len() >= limit || pool.exhausted || factor >= MAX_WIDENING {
                tracing::debug!(
                    owner = %query.owner,
                    candidates = pool.candidates.len(),
                    factor,
                    returned = ranked.len().min(limit),
                    "search ranked"
                );
                break ranked;
            }
            factor *= 4;
        };
        ranked.truncate(limit);

        self.note_recall(&query.owner, &ranked).await;
        Ok(ranked)
    }

    /// Hydrate fused candidates and score them with the second-stage reranker.
    async fn rerank_pool(&self, query: &HybridQuery, candidates: &[FusedCandidate]) -> Result<Vec<RankedMemory>> {
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<String> = candidates.iter().map(|c| c.id.clone()).collect();
        let (records, degrees) = {
            let store = Arc::clone(&self.targets.store);
            let graph = Arc::clone(&self.targets.graph);
            let ids = ids.clone();
            tokio::task::spawn_blocking(move || -> Result<_> {
                let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
                Ok((store.get_many(&refs)?, graph.weighted_degrees(&refs)?))
            })
            .await??
        };
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let activations = self.targets.activation.snapshot(&query.owner, &refs, Utc::now());

        let signals = RerankSignals {
            records,
            activations,
            degrees,
        };
        Ok(self.reranker.rerank(candidates, &signals))
    }

    /// Record that `ranked` was returned together.
    async fn note_recall(&self, owner: &str, ranked: &[RankedMemory]) {
        if ranked.is_empty() {
            return;
        }
        let ids: Vec<String> = ranked.iter().map(|r| r.record.id.clone()).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        self.targets.activation.record_recall(owner, &refs);

        let store = Arc::clone(&self.targets.store);
        let written = tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
            store.record_access(&refs, Utc::now())
        })
        .await
        .unwrap_or_else(|e| Err(e.into()));
        if let Err(e) = written {
            tracing::warn!(error = %e, "failed to record access stats");
        }
    }

    /// Hard-delete a record from the store and every index.
    pub async fn forget(&self, owner: &str, scope: Scope, key: &str) -> Result<ForgetAck> {
        let _guard = self.locks.acquire(&RecordKey::new(owner, scope, key)).await;
        self.indexer.flush().await?;
        let targets = self.targets.clone();
        let (owner, key) = (owner.to_string(), key.to_string());
        tokio::task::spawn_blocking(move || forget_record(&targets, &owner, scope, &key)).await?
    }

    /// Apply explicit feedback to a record's importance.
    pub async fn record_feedback(
        &self,
        owner: &str,
        scope: Scope,
        key: &str,
        label: FeedbackLabel,
        weight: f64,
    ) -> Result<FeedbackOutcome> {
        let _guard = self.locks.acquire(&RecordKey::new(owner, scope, key)).await;
        let scorer = Arc::clone(&self.scorer);
        let (owner, key) = (owner.to_string(), key.to_string());
        tokio::task::spawn_blocking(move || scorer.apply_feedback(&owner, scope, &key, label, weight)).await?
    }

    pub async fn list(
        &self,
        owner: &str,
        scope: Option<Scope>,
        filter: ListFilter,
        page: PageRequest,
    ) -> Result<Page<MemoryRecord>> {
        let store = Arc::clone(&self.targets.store);
        let owner = owner.to_string();
        tokio::task::spawn_blocking(move || store.list(&owner, scope, &filter, page)).await?
    }

    pub async fn audit_trail(&self, id: &str) -> Result<Vec<LogEntry>> {
        let store = Arc::clone(&self.targets.store);
        let id = id.to_string();
        tokio::task::spawn_blocking(move || store.audit_trail(&id)).await?
    }

    /// Records most often recalled together with `id`, strongest first.
    pub fn associations(&self, owner: &str, id: &str) -> Vec<(String, f64)> {
        self.targets.activation.associations(owner, id)
    }

    // ── Graph ────────────────────────────────────────────────────────────────

    pub async fn add_node(&self, node: NewNode) -> Result<GraphNode> {
        let graph = Arc::clone(&self.targets.graph);
        tokio::task::spawn_blocking(move || graph.add_node(node)).await?
    }

    /// Link two nodes. A record id stands for its memory node, which is
    /// created here if the indexer has not caught up yet.
    pub async fn link(&self, src: &str, dst: &str, rel_type: &str, weight: f64) -> Result<LinkOutcome> {
        let targets = self.targets.clone();
        let (src, dst, rel_type) = (src.to_string(), dst.to_string(), rel_type.to_string());
        tokio::task::spawn_blocking(move || -> Result<LinkOutcome> {
            ensure_record_node(&targets, &src)?;
            ensure_record_node(&targets, &dst)?;
            targets.graph.link(&src, &dst, &rel_type, weight)
        })
        .await?
    }

    /// Remove the `(src, dst, rel_type)` edge. `false` when there was none.
    pub async fn unlink(&self, src: &str, dst: &str, rel_type: &str) -> Result<bool> {
        let graph = Arc::clone(&self.targets.graph);
        let (src, dst, rel_type) = (src.to_string(), dst.to_string(), rel_type.to_string());
        tokio::task::spawn_blocking(move || graph.unlink(&src, &dst, &rel_type)).await?
    }

    /// Breadth-first neighborhood of `seeds`, depth capped at `graph.max_depth`.
    pub async fn query_graph(&self, seeds: &[String], depth: usize, rel_type: Option<&str>) -> Result<Subgraph> {
        let depth = depth.min(self.config.graph.max_depth);
        let graph = Arc::clone(&self.targets.graph);
        let seeds = seeds.to_vec();
        let rel_type = rel_type.map(str::to_string);
        tokio::task::spawn_blocking(move || {
            let refs: Vec<&str> = seeds.iter().map(String::as_str).collect();
            graph.traverse(&refs, depth, rel_type.as_deref())
        })
        .await?
    }

    pub async fn get_pattern(&self, owner: &str) -> Result<OwnerPattern> {
        validate_ident("owner", owner)?;
        let targets = self.targets.clone();
        let owner = owner.to_string();
        tokio::task::spawn_blocking(move || -> Result<OwnerPattern> {
            Ok(OwnerPattern {
                records: targets.store.count(Some(&owner))?,
                top_tags: stats::top_tags(targets.store.tag_frequency(&owner)?, None),
                graph: targets.graph.analyze_patterns(&owner)?,
                owner,
            })
        })
        .await?
    }

    /// Permanently drop orphaned edges.
    pub async fn purge_orphaned_edges(&self, owner: Option<&str>) -> Result<usize> {
        let graph = Arc::clone(&self.targets.graph);
        let owner = owner.map(str::to_string);
        tokio::task::spawn_blocking(move || graph.purge_orphaned(owner.as_deref())).await?
    }

    // ── Maintenance ──────────────────────────────────────────────────────────

    pub async fn prune_sessions(&self, older_than: DateTime<Utc>) -> Result<PruneReport> {
        maintenance::prune_sessions(&self.targets, &self.indexer, &self.locks, older_than).await
    }

    /// Rebuild derived indexes. Pending index jobs are applied first.
    pub async fn rebuild_indexes(&self, options: RebuildOptions) -> Result<RebuildReport> {
        self.indexer.flush().await?;
        maintenance::rebuild_indexes(&self.targets, &self.locks, options).await
    }

    /// Default rebuild options from `[indexing]`.
    pub fn rebuild_options(&self) -> RebuildOptions {
        RebuildOptions {
            concurrency: self.config.indexing.rebuild_concurrency,
            page_size: self.config.indexing.page_size,
            ..Default::default()
        }
    }

    pub async fn export<W: AsyncWrite + Unpin>(&self, writer: &mut W, options: &TransferOptions) -> Result<ExportReport> {
        self.indexer.flush().await?;
        transfer::export(&self.targets, writer, options).await
    }

    pub async fn import<R: AsyncBufRead + Unpin>(&self, reader: R, options: &TransferOptions) -> Result<ImportReport> {
        let report = transfer::import(&self.targets, &self.indexer, &self.locks, reader, options).await?;
        self.indexer.flush().await?;
        Ok(report)
    }

    /// Wait until every queued index update has been applied.
    pub async fn flush(&self) -> Result<()> {
        self.indexer.flush().await
    }

    pub async fn stats(&self, owner: Option<&str>) -> Result<MemoryStats> {
        let targets = self.targets.clone();
        let owner = owner.map(str::to_string);
        let db_path = self.db_path.clone();
        let indexer = self.indexer.stats();
        tokio::task::spawn_blocking(move || -> Result<MemoryStats> {
            let counts = {
                let reader = targets.store.reader_handle();
                let conn = crate::sync::lock(&reader);
                stats::store_counts(&conn, owner.as_deref())?
            };
            let (graph_nodes, live_edges, orphaned_edges) = targets.graph.counts(owner.as_deref())?;
            let top_tags = match &owner {
                Some(o) => stats::top_tags(targets.store.tag_frequency(o)?, None),
                None => Vec::new(),
            };
            Ok(MemoryStats {
                total_records: counts.total,
                by_scope: counts.by_scope,
                by_owner: counts.by_owner,
                top_tags,
                graph_nodes,
                live_edges,
                orphaned_edges,
                vector_backend: targets.vectors.backend().to_string(),
                vectors: targets.vectors.len()? as u64,
                lexical_documents: owner.as_deref().map(|o| targets.lexical.len(o) as u64),
                indexer,
                db_size_bytes: stats::db_size_bytes(db_path.as_deref()),
                oldest_record: counts.oldest,
                newest_record: counts.newest,
            })
        })
        .await?
    }

    pub async fn health(&self) -> Result<MemoryHealth> {
        let targets = self.targets.clone();
        let indexer = self.indexer.stats();
        tokio::task::spawn_blocking(move || -> Result<MemoryHealth> {
            let database = {
                let reader = targets.store.reader_handle();
                let conn = crate::sync::lock(&reader);
                crate::db::check_database_health(&conn)?
            };
            Ok(MemoryHealth {
                database,
                graph: targets.graph.check_integrity(false)?,
                vector_backend: targets.vectors.backend().to_string(),
                vector_dimensions: targets.vectors.dimensions(),
                vectors: targets.vectors.len()? as u64,
                vector_version: targets.vectors.version(),
                indexer,
            })
        })
        .await?
    }

    /// Drain the index queue and stop the background worker.
    pub async fn shutdown(&self) -> Result<()> {
        self.indexer.shutdown().await?;
        tracing::info!("memory engine stopped");
        Ok(())
    }
}

/// Record the vector width on first open and refuse a different one later.
fn check_dimensions(store: &RecordStore, dims: usize) -> Result<()> {
    let writer = store.writer_handle();
    let conn = crate::sync::lock(&writer);
    match migrations::get_vector_dimensions(&conn)? {
        Some(recorded) if recorded != dims => Err(MemoryError::validation(format!(
            "database holds {recorded}-dimensional vectors, config asks for {dims}"
        ))),
        Some(_) => Ok(()),
        None => {
            migrations::set_vector_dimensions(&conn, dims)?;
            Ok(())
        }
    }
}

/// Refill the lexical index from the record store.
fn warm_lexical(store: &RecordStore, lexical: &LexicalIndex, page_size: usize) -> Result<usize> {
    let mut after: Option<String> = None;
    let mut loaded = 0;
    loop {
        let page = store.scan(None, after.as_deref(), page_size.max(1))?;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id.clone());
        for record in &page {
            lexical.add(record);
        }
        loaded += page.len();
    }
    Ok(loaded)
}

fn ensure_record_node(targets: &IndexTargets, id: &str) -> Result<()> {
    if targets.graph.get_node(id)?.is_none() {
        if let Some(record) = targets.store.get_by_id(id)? {
            targets.graph.ensure_memory_node(&record)?;
        }
    }
    Ok(())
}
