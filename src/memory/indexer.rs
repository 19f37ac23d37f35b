//! Background index maintenance.
//!
//! Committed writes are fanned out to the derived indexes through a bounded
//! queue drained by one worker task, so `store` returns once the record is
//! durable. A full queue applies backpressure to writers. Jobs are applied in
//! order; failures are retried with exponential backoff and then logged,
//! never rolled back into the record store.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

use crate::error::{MemoryError, Result};
use crate::memory::activation::ActivationEngine;
use crate::memory::graph::GraphStore;
use crate::memory::lexical::LexicalIndex;
use crate::memory::store::RecordStore;
use crate::memory::types::MemoryRecord;
use crate::vector::{VectorIndex, VectorMetadata};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl From<&crate::config::IndexingConfig> for RetryPolicy {
    fn from(config: &crate::config::IndexingConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            ..Default::default()
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        Duration::from_millis(base as u64).min(self.max_delay)
    }
}

/// Work for the index worker.
#[derive(Debug)]
pub enum IndexJob {
    /// Index a freshly committed record, with its vector when one was supplied.
    Upsert {
        record: MemoryRecord,
        vector: Option<Vec<f32>>,
    },
    /// Resolves once every job queued before it has been applied.
    Flush(oneshot::Sender<()>),
}

impl IndexJob {
    fn describe(&self) -> (&'static str, &str) {
        match self {
            Self::Upsert { record, .. } => ("upsert", record.id.as_str()),
            Self::Flush(_) => ("flush", ""),
        }
    }
}

/// Everything the worker writes to.
#[derive(Clone)]
pub struct IndexTargets {
    pub store: Arc<RecordStore>,
    pub lexical: Arc<LexicalIndex>,
    pub vectors: Arc<dyn VectorIndex>,
    pub graph: Arc<GraphStore>,
    pub activation: Arc<ActivationEngine>,
}

impl IndexTargets {
    /// Apply one upsert to every index. Synchronous; run off the async runtime.
    pub fn index_record(&self, record: &MemoryRecord, vector: Option<&[f32]>) -> Result<()> {
        let metadata = VectorMetadata {
            owner: record.owner.clone(),
            scope: record.scope,
            tags: record.tags.clone(),
        };
        match vector {
            Some(vector) => {
                self.vectors.upsert(&record.id, vector, metadata)?;
                self.store.set_embedding_id(&record.id, Some(&record.id))?;
            }
            // value-only update: keep the old vector, refresh its filter metadata
            None => {
                if let Some(existing) = self.vectors.get(&record.id)? {
                    self.vectors.upsert(&record.id, &existing, metadata)?;
                }
            }
        }
        self.lexical.add(record);
        self.graph.ensure_memory_node(record)?;
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters {
    applied: AtomicU64,
    retried: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct IndexerStats {
    pub applied: u64,
    pub retried: u64,
    pub failed: u64,
}

pub struct Indexer {
    tx: mpsc::Sender<IndexJob>,
    worker: AsyncMutex<Option<JoinHandle<()>>>,
    counters: Arc<Counters>,
}

impl Indexer {
    /// Start the worker on the current tokio runtime.
    pub fn spawn(targets: IndexTargets, retry: RetryPolicy, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let counters = Arc::new(Counters::default());
        let worker = tokio::spawn(run_worker(rx, targets, retry, Arc::clone(&counters)));
        Self {
            tx,
            worker: AsyncMutex::new(Some(worker)),
            counters,
        }
    }

    /// Queue a job, waiting for room when the queue is full.
    pub async fn enqueue(&self, job: IndexJob) -> Result<()> {
        self.tx
            .send(job)
            .await
            .map_err(|_| MemoryError::indexing("index worker has stopped"))
    }

    /// Wait until everything queued so far has been applied (or given up on).
    pub async fn flush(&self) -> Result<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(IndexJob::Flush(done_tx)).await?;
        done_rx
            .await
            .map_err(|_| MemoryError::indexing("index worker stopped before flushing"))
    }

    pub fn stats(&self) -> IndexerStats {
        IndexerStats {
            applied: self.counters.applied.load(Ordering::Relaxed),
            retried: self.counters.retried.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Drain the queue and stop the worker.
    pub async fn shutdown(&self) -> Result<()> {
        self.flush().await?;
        if let Some(worker) = self.worker.lock().await.take() {
            worker.abort();
            let _ = worker.await;
        }
        Ok(())
    }
}

async fn run_worker(
    mut rx: mpsc::Receiver<IndexJob>,
    targets: IndexTargets,
    retry: RetryPolicy,
    counters: Arc<Counters>,
) {
    tracing::debug!("index worker started");
    while let Some(job) = rx.recv().await {
        let (kind, id) = job.describe();
        let (kind, id) = (kind, id.to_string());
        match job {
            IndexJob::Flush(done) => {
                let _ = done.send(());
            }
            IndexJob::Upsert { record, vector } => {
                let outcome = apply_with_retry(&retry, &counters, kind, &id, || {
                    let targets = targets.clone();
                    let record = record.clone();
                    let vector = vector.clone();
                    async move {
                        tokio::task::spawn_blocking(move || targets.index_record(&record, vector.as_deref()))
                            .await
                            .unwrap_or_else(|e| Err(e.into()))
                    }
                })
                .await;
                if outcome.is_ok() {
                    targets.activation.record_access(&record.owner, &record.id, &[]);
                }
            }
        }
    }
    tracing::debug!("index worker stopped");
}

async fn apply_with_retry<F, Fut>(
    retry: &RetryPolicy,
    counters: &Counters,
    kind: &str,
    id: &str,
    mut attempt_fn: F,
) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut attempt = 0;
    loop {
        match attempt_fn().await {
            Ok(()) => {
                counters.applied.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                let delay = retry.delay_for(attempt);
                tracing::warn!(
                    job = kind,
                    id,
                    attempt = attempt + 1,
                    max_retries = retry.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "retrying index job"
                );
                counters.retried.fetch_add(1, Ordering::Relaxed);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(job = kind, id, error = %e, "index job failed");
                counters.failed.fetch_add(1, Ordering::Relaxed);
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeDeletePolicy;
    use crate::memory::store::{NewRecord, StoreLimits};
    use crate::memory::types::Scope;
    use crate::vector::FlatIndex;

    fn targets(dims: usize) -> IndexTargets {
        let store = Arc::new(RecordStore::open_in_memory(StoreLimits::default()).unwrap());
        let graph = Arc::new(GraphStore::new(
            store.writer_handle(),
            store.reader_handle(),
            NodeDeletePolicy::Orphan,
        ));
        IndexTargets {
            store,
            lexical: Arc::new(LexicalIndex::default()),
            vectors: Arc::new(FlatIndex::new(dims)),
            graph,
            activation: Arc::new(ActivationEngine::default()),
        }
    }

    #[test]
    fn delay_backs_off_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn upsert_reaches_every_index() {
        let t = targets(2);
        let record = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "k", "hello world"))
            .unwrap()
            .record;
        let indexer = Indexer::spawn(t.clone(), RetryPolicy::default(), 4);
        indexer
            .enqueue(IndexJob::Upsert {
                record: record.clone(),
                vector: Some(vec![1.0, 0.0]),
            })
            .await
            .unwrap();
        indexer.flush().await.unwrap();

        assert!(t.lexical.contains("u", &record.id));
        assert_eq!(t.vectors.len().unwrap(), 1);
        assert!(t.graph.get_node(&record.id).unwrap().is_some());
        assert_eq!(
            t.store.get_by_id(&record.id).unwrap().unwrap().embedding_id.as_deref(),
            Some(record.id.as_str())
        );
        assert!(t.activation.activation_at("u", &record.id, chrono::Utc::now()) > 0.0);
        assert_eq!(indexer.stats().applied, 1);
    }

    #[tokio::test]
    async fn invalid_vector_fails_without_retry() {
        let t = targets(3);
        let record = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "k", "text"))
            .unwrap()
            .record;
        let indexer = Indexer::spawn(t.clone(), RetryPolicy::default(), 4);
        indexer
            .enqueue(IndexJob::Upsert {
                record,
                vector: Some(vec![1.0]),
            })
            .await
            .unwrap();
        indexer.flush().await.unwrap();

        let stats = indexer.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 0);
        // the durable record is untouched
        assert_eq!(t.store.count(None).unwrap(), 1);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let t = targets(2);
        let record = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "k", "text"))
            .unwrap()
            .record;

        let indexer = Indexer::spawn(t.clone(), RetryPolicy::default(), 4);
        indexer.shutdown().await.unwrap();
        let err = indexer
            .enqueue(IndexJob::Upsert { record, vector: None })
            .await
            .unwrap_err();
        assert!(matches!(err, MemoryError::Indexing(_)));
        assert!(indexer.flush().await.is_err());
    }
}
