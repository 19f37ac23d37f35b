use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

use super::forget::remove_everywhere;
use super::indexer::{IndexTargets, Indexer};
use super::locks::KeyLocks;
use super::types::{MemoryRecord, Scope};
use crate::embedding::EmbeddingProvider;
use crate::error::{MemoryError, Result};
use crate::sync::CancelToken;
use crate::vector::validate_vector;

/// Failures kept verbatim in a report; the rest are only counted.
const MAX_REPORTED_ERRORS: usize = 20;

// ── Result types ─────────────────────────────────────────────────────────────

#[derive(Debug, Default, Serialize)]
pub struct PruneReport {
    /// Stale session records found.
    pub candidates: usize,
    pub pruned: usize,
    /// Candidates written to or deleted by someone else since the scan.
    pub changed: usize,
    /// Records left in place because deleting them failed.
    pub skipped: usize,
}

#[derive(Debug, Default, Serialize)]
pub struct RebuildReport {
    pub scanned: u64,
    pub indexed: u64,
    /// Records that had no vector and got one from the embedding provider.
    pub embedded: u64,
    pub failed: u64,
    /// Records deleted while the rebuild was running.
    pub vanished: u64,
    /// Lexical entries with no record behind them, dropped at the end.
    pub stale_removed: u64,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Called with the number of records finished since the last call.
pub type ProgressFn = Arc<dyn Fn(u64) + Send + Sync>;

#[derive(Clone)]
pub struct RebuildOptions {
    pub concurrency: usize,
    pub page_size: usize,
    pub timeout: Option<Duration>,
    pub provider: Option<Arc<dyn EmbeddingProvider>>,
    pub cancel: CancelToken,
    pub progress: Option<ProgressFn>,
}

impl Default for RebuildOptions {
    fn default() -> Self {
        Self {
            concurrency: 4,
            page_size: 256,
            timeout: None,
            provider: None,
            cancel: CancelToken::new(),
            progress: None,
        }
    }
}

// ── Session pruning ──────────────────────────────────────────────────────────

/// Delete session-scoped records last updated before `older_than`, through
/// the same path as forget. A cutoff in the future is clamped to now.
///
/// Each candidate is re-read under its key lock and left alone if it was
/// touched after the cutoff or is no longer session-scoped.
pub async fn prune_sessions(
    targets: &IndexTargets,
    indexer: &Indexer,
    locks: &KeyLocks,
    older_than: DateTime<Utc>,
) -> Result<PruneReport> {
    let cutoff = older_than.min(Utc::now());
    indexer.flush().await?;

    let store = Arc::clone(&targets.store);
    let stale = tokio::task::spawn_blocking(move || store.stale_session_records(cutoff)).await??;
    let mut report = PruneReport {
        candidates: stale.len(),
        ..Default::default()
    };

    for record in stale {
        let _guard = locks.acquire(&record.record_key()).await;
        let t = targets.clone();
        let id = record.id;
        let current_id = id.clone();
        let outcome = tokio::task::spawn_blocking(move || -> Result<bool> {
            match t.store.get_by_id(&current_id)? {
                Some(current) if current.scope == Scope::Session && current.updated_at < cutoff => {
                    remove_everywhere(&t, &current, "prune")?;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
        .await?;

        match outcome {
            Ok(true) => report.pruned += 1,
            Ok(false) | Err(MemoryError::NotFound(_)) => report.changed += 1,
            Err(e) => {
                tracing::warn!(id = %id, error = %e, "could not prune stale session record");
                report.skipped += 1;
            }
        }
    }

    if report.candidates > 0 {
        tracing::info!(
            candidates = report.candidates,
            pruned = report.pruned,
            changed = report.changed,
            skipped = report.skipped,
            "session records pruned"
        );
    }
    Ok(report)
}

// ── Index rebuild ────────────────────────────────────────────────────────────

enum ItemOutcome {
    Indexed { embedded: bool },
    Vanished,
    Skipped,
}

/// Rebuild the derived indexes from the record store.
///
/// Every record is re-indexed in place under its key lock, so writers and
/// forget never see a half-built index. Existing vectors are re-upserted
/// with fresh metadata; records without one are embedded when a provider is
/// given. Lexical entries whose record is gone are swept at the end. One
/// record failing never stops the rest.
pub async fn rebuild_indexes(
    targets: &IndexTargets,
    locks: &KeyLocks,
    options: RebuildOptions,
) -> Result<RebuildReport> {
    match options.timeout {
        Some(limit) => tokio::time::timeout(limit, rebuild_pages(targets, locks, &options))
            .await
            .map_err(|_| MemoryError::Timeout(limit))?,
        None => rebuild_pages(targets, locks, &options).await,
    }
}

async fn rebuild_pages(targets: &IndexTargets, locks: &KeyLocks, options: &RebuildOptions) -> Result<RebuildReport> {
    let semaphore = Arc::new(Semaphore::new(options.concurrency.max(1)));
    let mut report = RebuildReport::default();
    let mut after: Option<String> = None;
    let mut seen: HashSet<String> = HashSet::new();

    tracing::info!(concurrency = options.concurrency, "rebuilding indexes");

    loop {
        if options.cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }

        let store = Arc::clone(&targets.store);
        let cursor = after.clone();
        let page_size = options.page_size.max(1);
        let page = tokio::task::spawn_blocking(move || store.scan(None, cursor.as_deref(), page_size)).await??;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id.clone());
        let page_len = page.len() as u64;
        report.scanned += page_len;
        seen.extend(page.iter().map(|r| r.id.clone()));

        let tasks = page.into_iter().map(|record| {
            let id = record.id.clone();
            let item = rebuild_item(
                Arc::clone(&semaphore),
                targets.clone(),
                locks,
                record,
                options.provider.clone(),
                options.cancel.clone(),
            );
            async move { (id, item.await) }
        });

        for (id, outcome) in join_all(tasks).await {
            match outcome {
                Ok(ItemOutcome::Indexed { embedded }) => {
                    report.indexed += 1;
                    if embedded {
                        report.embedded += 1;
                    }
                }
                Ok(ItemOutcome::Vanished) => report.vanished += 1,
                Ok(ItemOutcome::Skipped) => report.cancelled = true,
                Err(e) => {
                    tracing::warn!(id = %id, error = %e, "failed to rebuild record");
                    report.failed += 1;
                    if report.errors.len() < MAX_REPORTED_ERRORS {
                        report.errors.push(format!("{id}: {e}"));
                    }
                }
            }
        }

        if let Some(progress) = &options.progress {
            progress(page_len);
        }
    }

    if !report.cancelled {
        let t = targets.clone();
        report.stale_removed = tokio::task::spawn_blocking(move || sweep_lexical(&t, &seen)).await??;
    }

    tracing::info!(
        scanned = report.scanned,
        indexed = report.indexed,
        embedded = report.embedded,
        failed = report.failed,
        vanished = report.vanished,
        stale_removed = report.stale_removed,
        cancelled = report.cancelled,
        "index rebuild finished"
    );
    Ok(report)
}

async fn rebuild_item(
    semaphore: Arc<Semaphore>,
    targets: IndexTargets,
    locks: &KeyLocks,
    record: MemoryRecord,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    cancel: CancelToken,
) -> Result<ItemOutcome> {
    let _permit = semaphore
        .acquire_owned()
        .await
        .map_err(|_| MemoryError::Cancelled)?;
    if cancel.is_cancelled() {
        return Ok(ItemOutcome::Skipped);
    }
    let _guard = locks.acquire(&record.record_key()).await;
    tokio::task::spawn_blocking(move || -> Result<ItemOutcome> {
        // the page is a snapshot; index what is stored now
        let Some(current) = targets.store.get_by_id(&record.id)? else {
            return Ok(ItemOutcome::Vanished);
        };
        let embedded = rebuild_one(&targets, &current, provider.as_deref())?;
        Ok(ItemOutcome::Indexed { embedded })
    })
    .await?
}

/// Re-index one record. Returns `true` when a new vector had to be embedded.
fn rebuild_one(
    targets: &IndexTargets,
    record: &MemoryRecord,
    provider: Option<&dyn EmbeddingProvider>,
) -> Result<bool> {
    let existing = targets.vectors.get(&record.id)?;
    let (vector, embedded) = match (existing, provider) {
        (Some(v), _) => (Some(v), false),
        (None, Some(provider)) => {
            let v = provider.embed(&record.indexable_text())?;
            validate_vector(&v, targets.vectors.dimensions())?;
            (Some(v), true)
        }
        (None, None) => (None, false),
    };
    targets.index_record(record, vector.as_deref())?;
    Ok(embedded)
}

/// Drop lexical entries the scan never saw and the store no longer has.
fn sweep_lexical(targets: &IndexTargets, seen: &HashSet<String>) -> Result<u64> {
    let mut removed = 0;
    for (owner, id) in targets.lexical.entries() {
        if seen.contains(&id) || targets.store.get_by_id(&id)?.is_some() {
            continue;
        }
        if targets.lexical.remove(&owner, &id) {
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeDeletePolicy;
    use crate::memory::activation::ActivationEngine;
    use crate::memory::graph::GraphStore;
    use crate::memory::indexer::RetryPolicy;
    use crate::memory::lexical::{LexicalFilter, LexicalIndex};
    use crate::memory::store::{NewRecord, RecordStore, StoreLimits};
    use crate::memory::types::Scope;
    use crate::vector::FlatIndex;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn targets() -> IndexTargets {
        let store = Arc::new(RecordStore::open_in_memory(StoreLimits::default()).unwrap());
        let graph = Arc::new(GraphStore::new(
            store.writer_handle(),
            store.reader_handle(),
            NodeDeletePolicy::Orphan,
        ));
        IndexTargets {
            store,
            lexical: Arc::new(LexicalIndex::default()),
            vectors: Arc::new(FlatIndex::new(2)),
            graph,
            activation: Arc::new(ActivationEngine::default()),
        }
    }

    /// Embeds everything except texts containing "poison".
    struct Picky;

    impl EmbeddingProvider for Picky {
        fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("poison") {
                Err(MemoryError::indexing("provider rejected input"))
            } else {
                Ok(vec![1.0, 0.5])
            }
        }

        fn dimensions(&self) -> usize {
            2
        }
    }

    #[tokio::test]
    async fn rebuild_isolates_failures_and_reports_progress() {
        let t = targets();
        for key in ["a", "b", "c"] {
            t.store.put(NewRecord::new("u", Scope::Persistent, key, "plain")).unwrap();
        }
        t.store
            .put(NewRecord::new("u", Scope::Persistent, "d", "poison pill"))
            .unwrap();

        let seen = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&seen);
        let report = rebuild_indexes(
            &t,
            &KeyLocks::new(),
            RebuildOptions {
                concurrency: 2,
                page_size: 3,
                provider: Some(Arc::new(Picky)),
                progress: Some(Arc::new(move |n| {
                    counter.fetch_add(n, Ordering::SeqCst);
                })),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(report.scanned, 4);
        assert_eq!(report.indexed, 3);
        assert_eq!(report.embedded, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.errors.len(), 1);
        assert!(!report.cancelled);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_eq!(t.vectors.len().unwrap(), 3);
        assert_eq!(t.lexical.len("u"), 3);
    }

    #[tokio::test]
    async fn rebuild_keeps_existing_vectors() {
        let t = targets();
        let record = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "k", "kept vector"))
            .unwrap()
            .record;
        t.index_record(&record, Some(&[0.0, 1.0])).unwrap();
        t.lexical.remove("u", &record.id);

        let report = rebuild_indexes(&t, &KeyLocks::new(), RebuildOptions::default()).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.embedded, 0);
        assert_eq!(t.vectors.get(&record.id).unwrap(), Some(vec![0.0, 1.0]));
        let hits = t.lexical.query("u", "kept", 5, &LexicalFilter::default());
        assert_eq!(hits[0].0, record.id);
    }

    #[tokio::test]
    async fn cancelled_rebuild_stops_before_work() {
        let t = targets();
        t.store.put(NewRecord::new("u", Scope::Persistent, "k", "v")).unwrap();
        let cancel = CancelToken::new();
        cancel.cancel();

        let report = rebuild_indexes(
            &t,
            &KeyLocks::new(),
            RebuildOptions {
                cancel,
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.indexed, 0);
    }

    #[tokio::test]
    async fn prune_removes_only_stale_sessions() {
        let t = targets();
        let indexer = Indexer::spawn(t.clone(), RetryPolicy::default(), 16);
        let locks = KeyLocks::new();

        let session = t
            .store
            .put(NewRecord::new("u", Scope::Session, "scratch", "temp note"))
            .unwrap()
            .record;
        let durable = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "fact", "keep me"))
            .unwrap()
            .record;
        t.index_record(&session, Some(&[1.0, 0.0])).unwrap();
        t.index_record(&durable, None).unwrap();

        let cutoff = Utc::now() + chrono::Duration::seconds(1);
        let report = prune_sessions(&t, &indexer, &locks, cutoff).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.pruned, 1);
        assert_eq!(report.changed, 0);
        assert_eq!(report.skipped, 0);
        let trail = t.store.audit_trail(&session.id).unwrap();
        assert!(trail
            .iter()
            .any(|e| e.operation == "delete" && e.details.as_ref().is_some_and(|d| d["reason"] == "prune")));

        assert!(t.store.get_by_id(&session.id).unwrap().is_none());
        assert!(t.vectors.get(&session.id).unwrap().is_none());
        assert!(!t.lexical.contains("u", &session.id));
        assert!(t.store.get_by_id(&durable.id).unwrap().is_some());
        indexer.shutdown().await.unwrap();
    }
    #[tokio::test]
    async fn rebuild_sweeps_entries_without_records() {
        let t = targets();
        let live = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "live", "still here"))
            .unwrap()
            .record;
        let gone = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "gone", "left behind"))
            .unwrap()
            .record;
        t.index_record(&live, None).unwrap();
        t.index_record(&gone, None).unwrap();
        t.store.delete_by_id(&gone.id, "test").unwrap();

        let report = rebuild_indexes(&t, &KeyLocks::new(), RebuildOptions::default()).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.stale_removed, 1);
        assert!(t.lexical.contains("u", &live.id));
        assert!(!t.lexical.contains("u", &gone.id));
    }

    #[tokio::test]
    async fn rebuild_does_not_resurrect_a_record_forgotten_midway() {
        let t = targets();
        let record = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "k", "short lived"))
            .unwrap()
            .record;
        t.index_record(&record, Some(&[1.0, 0.0])).unwrap();

        let locks = KeyLocks::new();
        let guard = locks.acquire(&record.record_key()).await;
        let forgetter = {
            let t = t.clone();
            let record = record.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                remove_everywhere(&t, &record, "forget").unwrap();
                drop(guard);
            }
        };
        let (report, ()) = tokio::join!(rebuild_indexes(&t, &locks, RebuildOptions::default()), forgetter);
        let report = report.unwrap();

        assert_eq!(report.scanned, 1);
        assert_eq!(report.vanished, 1);
        assert!(!t.lexical.contains("u", &record.id));
        assert!(t.vectors.get(&record.id).unwrap().is_none());
        assert!(t.graph.get_node(&record.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn prune_leaves_a_record_rewritten_after_the_scan() {
        let t = targets();
        let indexer = Indexer::spawn(t.clone(), RetryPolicy::default(), 16);
        let locks = KeyLocks::new();
        let session = t
            .store
            .put(NewRecord::new("u", Scope::Session, "scratch", "first draft"))
            .unwrap()
            .record;
        t.index_record(&session, None).unwrap();

        let guard = locks.acquire(&session.record_key()).await;
        let writer = {
            let t = t.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                t.store
                    .put(NewRecord::new("u", Scope::Session, "scratch", "second draft"))
                    .unwrap();
                drop(guard);
            }
        };
        let cutoff = Utc::now() + chrono::Duration::hours(1);
        let (report, ()) = tokio::join!(prune_sessions(&t, &indexer, &locks, cutoff), writer);
        let report = report.unwrap();

        assert_eq!(report.candidates, 1);
        assert_eq!(report.pruned, 0);
        assert_eq!(report.changed, 1);
        let kept = t.store.get_by_id(&session.id).unwrap().unwrap();
        assert_eq!(kept.value, "second draft");
        indexer.shutdown().await.unwrap();
    }
}
