//! JSON Lines export and import.
//!
//! One line per item, tagged by `kind`:
//!
//! ```text
//! {"kind":"memory","id":"…","owner":"u","key":"…", …, "vector":[0.1, …]}
//! {"kind":"graph_node","id":"…","owner":"u","type":"topic", …}
//! {"kind":"graph_edge","id":"…","src":"…","dst":"…","rel_type":"…", …}
//! ```
//!
//! Both directions stream page by page and never hold the whole dataset.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use super::indexer::{IndexJob, IndexTargets, Indexer};
use super::locks::KeyLocks;
use super::store::NewRecord;
use super::types::{GraphEdge, GraphNode, MemoryRecord};
use crate::error::{MemoryError, Result};
use crate::sync::CancelToken;
use crate::vector::validate_vector;

const MAX_REPORTED_ERRORS: usize = 20;

/// One line of the interchange format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransferLine {
    Memory {
        #[serde(flatten)]
        record: MemoryRecord,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vector: Option<Vec<f32>>,
    },
    GraphNode(GraphNode),
    GraphEdge(GraphEdge),
}

#[derive(Debug, Clone)]
pub struct TransferOptions {
    /// Export only this owner's data; import ignores it.
    pub owner: Option<String>,
    pub page_size: usize,
    pub timeout: Option<Duration>,
    pub cancel: CancelToken,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            owner: None,
            page_size: 256,
            timeout: None,
            cancel: CancelToken::new(),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct ExportReport {
    pub memories: u64,
    pub vectors: u64,
    pub nodes: u64,
    pub edges: u64,
    pub cancelled: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct ImportReport {
    pub lines: u64,
    pub memories: u64,
    pub nodes: u64,
    pub edges: u64,
    pub failed: u64,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

async fn with_timeout<T>(limit: Option<Duration>, work: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, work)
            .await
            .map_err(|_| MemoryError::Timeout(limit))?,
        None => work.await,
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &TransferLine) -> Result<()> {
    let mut bytes = serde_json::to_vec(line)?;
    bytes.push(b'\n');
    writer.write_all(&bytes).await?;
    Ok(())
}

// ── Export ───────────────────────────────────────────────────────────────────

/// Write memories, then graph nodes, then graph edges to `writer`.
pub async fn export<W: AsyncWrite + Unpin>(
    targets: &IndexTargets,
    writer: &mut W,
    options: &TransferOptions,
) -> Result<ExportReport> {
    with_timeout(options.timeout, export_pages(targets, writer, options)).await
}

async fn export_pages<W: AsyncWrite + Unpin>(
    targets: &IndexTargets,
    writer: &mut W,
    options: &TransferOptions,
) -> Result<ExportReport> {
    let mut report = ExportReport::default();
    let page_size = options.page_size.max(1);

    let mut after: Option<String> = None;
    loop {
        if options.cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        let t = targets.clone();
        let owner = options.owner.clone();
        let cursor = after.take();
        let page = tokio::task::spawn_blocking(move || -> Result<Vec<(MemoryRecord, Option<Vec<f32>>)>> {
            let records = t.store.scan(owner.as_deref(), cursor.as_deref(), page_size)?;
            let mut page = Vec::with_capacity(records.len());
            for record in records {
                let vector = t.vectors.get(&record.id)?;
                page.push((record, vector));
            }
            Ok(page)
        })
        .await??;
        let Some((last, _)) = page.last() else {
            break;
        };
        after = Some(last.id.clone());
        for (record, vector) in page {
            report.memories += 1;
            if vector.is_some() {
                report.vectors += 1;
            }
            write_line(writer, &TransferLine::Memory { record, vector }).await?;
        }
    }

    let mut after: Option<String> = None;
    loop {
        if options.cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        let graph = Arc::clone(&targets.graph);
        let owner = options.owner.clone();
        let cursor = after.take();
        let page =
            tokio::task::spawn_blocking(move || graph.scan_nodes(owner.as_deref(), cursor.as_deref(), page_size))
                .await??;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id.clone());
        for node in page {
            report.nodes += 1;
            write_line(writer, &TransferLine::GraphNode(node)).await?;
        }
    }

    let mut after: Option<String> = None;
    loop {
        if options.cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }
        let graph = Arc::clone(&targets.graph);
        let owner = options.owner.clone();
        let cursor = after.take();
        let page =
            tokio::task::spawn_blocking(move || graph.scan_edges(owner.as_deref(), cursor.as_deref(), page_size))
                .await??;
        let Some(last) = page.last() else {
            break;
        };
        after = Some(last.id.clone());
        for edge in page {
            report.edges += 1;
            write_line(writer, &TransferLine::GraphEdge(edge)).await?;
        }
    }

    writer.flush().await?;
    tracing::info!(
        memories = report.memories,
        nodes = report.nodes,
        edges = report.edges,
        "export finished"
    );
    Ok(report)
}

// ── Import ───────────────────────────────────────────────────────────────────

/// Read JSON Lines from `reader` and restore them.
///
/// Memories keep their ids and go through the normal write path (key lock,
/// durable upsert, index queue). A malformed or rejected line is counted and
/// skipped.
pub async fn import<R: AsyncBufRead + Unpin>(
    targets: &IndexTargets,
    indexer: &Indexer,
    locks: &KeyLocks,
    reader: R,
    options: &TransferOptions,
) -> Result<ImportReport> {
    with_timeout(options.timeout, import_lines(targets, indexer, locks, reader, options)).await
}

async fn import_lines<R: AsyncBufRead + Unpin>(
    targets: &IndexTargets,
    indexer: &Indexer,
    locks: &KeyLocks,
    reader: R,
    options: &TransferOptions,
) -> Result<ImportReport> {
    let mut report = ImportReport::default();
    let mut lines = reader.lines();
    let mut memory_nodes_settled = false;

    while let Some(line) = lines.next_line().await? {
        if options.cancel.is_cancelled() {
            report.cancelled = true;
            break;
        }
        report.lines += 1;
        if line.trim().is_empty() {
            continue;
        }

        let outcome = match serde_json::from_str::<TransferLine>(&line) {
            Ok(item) => {
                // edges may point at memory nodes the index queue has not created yet
                if matches!(item, TransferLine::GraphEdge(_)) && !memory_nodes_settled {
                    indexer.flush().await?;
                    memory_nodes_settled = true;
                }
                import_item(targets, indexer, locks, item, &mut report).await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = outcome {
            tracing::warn!(line = report.lines, error = %e, "skipping import line");
            report.failed += 1;
            if report.errors.len() < MAX_REPORTED_ERRORS {
                report.errors.push(format!("line {}: {e}", report.lines));
            }
        }
    }

    tracing::info!(
        lines = report.lines,
        memories = report.memories,
        nodes = report.nodes,
        edges = report.edges,
        failed = report.failed,
        "import finished"
    );
    Ok(report)
}

async fn import_item(
    targets: &IndexTargets,
    indexer: &Indexer,
    locks: &KeyLocks,
    item: TransferLine,
    report: &mut ImportReport,
) -> Result<()> {
    match item {
        TransferLine::Memory { record, vector } => {
            if let Some(v) = &vector {
                validate_vector(v, targets.vectors.dimensions())?;
            }
            let _guard = locks.acquire(&record.record_key()).await;
            let store = Arc::clone(&targets.store);
            let stored = tokio::task::spawn_blocking(move || -> Result<MemoryRecord> {
                let details = serde_json::json!({"source_version": record.version});
                let new = NewRecord {
                    owner: record.owner,
                    scope: record.scope,
                    key: record.key,
                    value: record.value,
                    tags: record.tags,
                    importance: record.importance,
                    metadata: record.metadata,
                    expected_version: None,
                    id: Some(record.id),
                };
                let stored = store.put(new)?.record;
                store.audit("import", &stored.id, Some(&details))?;
                Ok(stored)
            })
            .await??;
            indexer
                .enqueue(IndexJob::Upsert {
                    record: stored,
                    vector,
                })
                .await?;
            report.memories += 1;
        }
        TransferLine::GraphNode(node) => {
            let graph = Arc::clone(&targets.graph);
            tokio::task::spawn_blocking(move || graph.restore_node(&node)).await??;
            report.nodes += 1;
        }
        TransferLine::GraphEdge(edge) => {
            let graph = Arc::clone(&targets.graph);
            tokio::task::spawn_blocking(move || graph.restore_edge(&edge)).await??;
            report.edges += 1;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{NodeType, Scope};

    #[test]
    fn memory_line_is_tagged_and_flat() {
        let now = chrono::Utc::now();
        let line = TransferLine::Memory {
            record: MemoryRecord {
                id: "id-1".into(),
                owner: "u".into(),
                scope: Scope::Persistent,
                key: "k".into(),
                value: "v".into(),
                tags: vec!["t".into()],
                importance: 0.7,
                metadata: serde_json::json!({"source": "test"}),
                embedding_id: None,
                version: 3,
                access_count: 0,
                last_accessed_at: None,
                created_at: now,
                updated_at: now,
            },
            vector: Some(vec![0.5, 0.5]),
        };
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["kind"], "memory");
        assert_eq!(json["key"], "k");
        assert_eq!(json["vector"][0], 0.5);

        let back: TransferLine = serde_json::from_value(json).unwrap();
        match back {
            TransferLine::Memory { record, vector } => {
                assert_eq!(record.id, "id-1");
                assert_eq!(record.metadata["source"], "test");
                assert_eq!(vector.unwrap().len(), 2);
            }
            other => panic!("unexpected line: {other:?}"),
        }
    }

    #[test]
    fn node_line_keeps_type_field() {
        let line = TransferLine::GraphNode(GraphNode {
            id: "n".into(),
            owner: "u".into(),
            node_type: NodeType::Topic,
            data: serde_json::json!({"label": "rust"}),
            created_at: chrono::Utc::now(),
        });
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["kind"], "graph_node");
        assert_eq!(json["type"], "topic");
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = serde_json::from_str::<TransferLine>(r#"{"kind":"mystery","id":"x"}"#);
        assert!(err.is_err());
    }
}
