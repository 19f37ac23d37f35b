use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct MnemaConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub retrieval: RetrievalConfig,
    pub rerank: RerankConfig,
    pub activation: ActivationConfig,
    pub feedback: FeedbackConfig,
    pub indexing: IndexingConfig,
    pub graph: GraphConfig,
    pub vector: VectorConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub vector_db_path: String,
    /// Upper bound on records per owner; `None` means unlimited.
    pub max_records_per_owner: Option<u64>,
    pub max_value_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub bm25_k1: f64,
    pub bm25_b: f64,
    pub lexical_candidates: usize,
    pub semantic_candidates: usize,
    pub fused_candidates: usize,
    pub rrf_k: usize,
    pub lexical_weight: f64,
    pub semantic_weight: f64,
    pub default_k: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RerankConfig {
    pub semantic_weight: f64,
    pub activation_weight: f64,
    pub importance_weight: f64,
    pub graph_weight: f64,
    pub relevance_weight: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ActivationConfig {
    /// Added to a record's activation on every access.
    pub boost: f64,
    /// Hebbian learning rate (η).
    pub learning_rate: f64,
    /// Exponential decay constant (λ), per second.
    pub decay_rate: f64,
    /// Activation added per unit of `useful` feedback weight.
    pub feedback_boost: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FeedbackConfig {
    pub step: f64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IndexingConfig {
    pub queue_capacity: usize,
    pub max_retries: u32,
    pub retry_initial_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub rebuild_concurrency: usize,
    pub page_size: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeDeletePolicy {
    /// Keep edges but flag them `orphaned`; traversal skips them.
    Orphan,
    /// Delete every edge touching the node.
    Cascade,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GraphConfig {
    pub on_node_delete: NodeDeletePolicy,
    pub max_depth: usize,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VectorBackend {
    Flat,
    SqliteVec,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VectorConfig {
    pub backend: VectorBackend,
    pub dimensions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_mnema_dir();
        Self {
            db_path: dir.join("memory.db").to_string_lossy().into_owned(),
            vector_db_path: dir.join("vectors.db").to_string_lossy().into_owned(),
            max_records_per_owner: None,
            max_value_bytes: 1024 * 1024,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            bm25_k1: 1.5,
            bm25_b: 0.75,
            lexical_candidates: 20,
            semantic_candidates: 20,
            fused_candidates: 20,
            rrf_k: 60,
            lexical_weight: 1.0,
            semantic_weight: 1.0,
            default_k: 5,
        }
    }
}

impl Default for RerankConfig {
    fn default() -> Self {
        Self {
            semantic_weight: 0.35,
            activation_weight: 0.15,
            importance_weight: 0.2,
            graph_weight: 0.1,
            relevance_weight: 0.2,
        }
    }
}

impl Default for ActivationConfig {
    fn default() -> Self {
        Self {
            boost: 1.0,
            learning_rate: 0.1,
            decay_rate: 1e-5,
            feedback_boost: 0.5,
        }
    }
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self { step: 0.1 }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            max_retries: 3,
            retry_initial_delay_ms: 100,
            retry_max_delay_ms: 5_000,
            rebuild_concurrency: 4,
            page_size: 256,
        }
    }
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            on_node_delete: NodeDeletePolicy::Orphan,
            max_depth: 6,
        }
    }
}

impl Default for VectorConfig {
    fn default() -> Self {
        Self {
            backend: VectorBackend::Flat,
            dimensions: 384,
        }
    }
}

/// Returns `~/.mnema/`
pub fn default_mnema_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".mnema")
}

/// Returns the default config file path: `~/.mnema/config.toml`
pub fn default_config_path() -> PathBuf {
    default_mnema_dir().join("config.toml")
}

impl MnemaConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            MnemaConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides
    /// (MNEMA_DB, MNEMA_VECTOR_DB, MNEMA_LOG_LEVEL, MNEMA_VECTOR_BACKEND).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("MNEMA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("MNEMA_VECTOR_DB") {
            self.storage.vector_db_path = val;
        }
        if let Ok(val) = std::env::var("MNEMA_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("MNEMA_VECTOR_BACKEND") {
            match val.as_str() {
                "flat" => self.vector.backend = VectorBackend::Flat,
                "sqlite_vec" => self.vector.backend = VectorBackend::SqliteVec,
                other => tracing::warn!(value = other, "ignoring unknown MNEMA_VECTOR_BACKEND"),
            }
        }
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let r = &self.retrieval;
        if r.bm25_k1 < 0.0 {
            bail!("retrieval.bm25_k1 must be >= 0");
        }
        if !(0.0..=1.0).contains(&r.bm25_b) {
            bail!("retrieval.bm25_b must be within [0, 1]");
        }
        if r.fused_candidates == 0 || r.default_k == 0 {
            bail!("retrieval.fused_candidates and retrieval.default_k must be > 0");
        }
        if r.lexical_weight < 0.0 || r.semantic_weight < 0.0 {
            bail!("retrieval source weights must be >= 0");
        }
        let w = &self.rerank;
        for (name, value) in [
            ("semantic_weight", w.semantic_weight),
            ("activation_weight", w.activation_weight),
            ("importance_weight", w.importance_weight),
            ("graph_weight", w.graph_weight),
            ("relevance_weight", w.relevance_weight),
        ] {
            if value < 0.0 || !value.is_finite() {
                bail!("rerank.{name} must be a non-negative number");
            }
        }
        let a = &self.activation;
        if a.boost < 0.0 || a.learning_rate < 0.0 || a.decay_rate < 0.0 || a.feedback_boost < 0.0
        {
            bail!("activation parameters must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.feedback.step) {
            bail!("feedback.step must be within [0, 1]");
        }
        if self.indexing.queue_capacity == 0
            || self.indexing.rebuild_concurrency == 0
            || self.indexing.page_size == 0
        {
            bail!("indexing.queue_capacity, rebuild_concurrency and page_size must be > 0");
        }
        if self.vector.dimensions == 0 {
            bail!("vector.dimensions must be > 0");
        }
        Ok(())
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    pub fn resolved_vector_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.vector_db_path)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
