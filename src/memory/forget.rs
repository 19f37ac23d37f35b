//! Hard deletion across every index.
//!
//! The in-memory indexes (vector, lexical, activation) let go of the record
//! first. The durable row and its graph node then go in one SQLite
//! transaction, so a failed delete leaves the node and its edges exactly as
//! they were. On failure the in-memory indexes are put back from snapshots
//! and the caller can simply retry.

use serde::Serialize;

use crate::error::{MemoryError, Result};
use crate::memory::activation::ActivationState;
use crate::memory::graph::NodeDeletion;
use crate::memory::indexer::IndexTargets;
use crate::memory::types::{MemoryRecord, Scope};

/// Acknowledgement returned by a successful forget.
#[derive(Debug, Clone, Serialize)]
pub struct ForgetAck {
    pub id: String,
    pub owner: String,
    pub scope: Scope,
    pub key: String,
    pub vector_removed: bool,
    pub lexical_removed: bool,
    pub graph: NodeDeletion,
}

/// Forget the record at `(owner, scope, key)`.
///
/// Synchronous; the caller holds the key lock and has flushed the index queue.
pub fn forget_record(targets: &IndexTargets, owner: &str, scope: Scope, key: &str) -> Result<ForgetAck> {
    let record = targets
        .store
        .get(owner, scope, key)?
        .ok_or_else(|| MemoryError::not_found(format!("{owner}/{scope}/{key}")))?;
    remove_everywhere(targets, &record, "forget")
}

/// What the in-memory indexes held for a record before it was detached.
struct Detached {
    vector: Option<Vec<f32>>,
    activation: Option<ActivationState>,
    vector_removed: bool,
    lexical_removed: bool,
}

/// Remove `record` from every index and delete it durably, with `reason` in
/// the audit trail.
pub(crate) fn remove_everywhere(targets: &IndexTargets, record: &MemoryRecord, reason: &str) -> Result<ForgetAck> {
    let detached = detach(targets, record)?;

    let graph = &targets.graph;
    let result = targets
        .store
        .delete_by_id_with(&record.id, reason, |conn| graph.delete_node_in(conn, &record.id))
        .and_then(|deleted| deleted.ok_or_else(|| MemoryError::not_found(record.id.clone())));

    match result {
        Ok(graph) => {
            tracing::info!(id = %record.id, owner = %record.owner, reason, "record forgotten");
            Ok(ForgetAck {
                id: record.id.clone(),
                owner: record.owner.clone(),
                scope: record.scope,
                key: record.key.clone(),
                vector_removed: detached.vector_removed,
                lexical_removed: detached.lexical_removed,
                graph,
            })
        }
        Err(MemoryError::NotFound(what)) => Err(MemoryError::NotFound(what)),
        Err(e) => {
            tracing::warn!(id = %record.id, error = %e, "forget failed, restoring indexes");
            reattach(targets, record, detached);
            Err(e)
        }
    }
}

fn detach(targets: &IndexTargets, record: &MemoryRecord) -> Result<Detached> {
    let vector = targets.vectors.get(&record.id)?;
    let activation = targets.activation.state(&record.owner, &record.id);

    let vector_removed = targets.vectors.delete(&record.id)?;
    let lexical_removed = targets.lexical.remove(&record.owner, &record.id);
    targets.activation.remove(&record.owner, &record.id);

    Ok(Detached {
        vector,
        activation,
        vector_removed,
        lexical_removed,
    })
}

fn reattach(targets: &IndexTargets, record: &MemoryRecord, detached: Detached) {
    if let Err(e) = targets.index_record(record, detached.vector.as_deref()) {
        tracing::error!(id = %record.id, error = %e, "failed to restore indexes");
    }
    if let Some(state) = detached.activation {
        targets.activation.restore(&record.owner, &record.id, state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeDeletePolicy;
    use crate::memory::activation::ActivationEngine;
    use crate::memory::graph::GraphStore;
    use crate::memory::lexical::LexicalIndex;
    use crate::memory::store::{NewRecord, RecordStore, StoreLimits};
    use crate::vector::flat::FlatIndex;
    use crate::vector::VectorIndex;
    use std::sync::Arc;

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
            vectors: Arc::new(FlatIndex::new(3)),
            graph,
            activation: Arc::new(ActivationEngine::default()),
        }
    }

    #[test]
    fn forget_clears_every_index() {
        let t = targets();
        let record = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "k", "alpha beta"))
            .unwrap()
            .record;
        t.index_record(&record, Some(&[1.0, 0.0, 0.0])).unwrap();
        t.activation.record_access("u", &record.id, &[]);

        let ack = forget_record(&t, "u", Scope::Persistent, "k").unwrap();
        assert!(ack.vector_removed);
        assert!(ack.lexical_removed);
        assert!(ack.graph.deleted);
        assert!(t.store.get_by_id(&record.id).unwrap().is_none());
        assert!(t.vectors.get(&record.id).unwrap().is_none());
        assert!(!t.lexical.contains("u", &record.id));
        assert!(t.activation.state("u", &record.id).is_none());
        assert!(t.graph.get_node(&record.id).unwrap().is_none());
    }

    #[test]
    fn second_forget_is_not_found() {
        let t = targets();
        let record = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "k", "v"))
            .unwrap()
            .record;
        t.index_record(&record, None).unwrap();

        forget_record(&t, "u", Scope::Persistent, "k").unwrap();
        let trail_len = t.store.audit_trail(&record.id).unwrap().len();

        let err = forget_record(&t, "u", Scope::Persistent, "k").unwrap_err();
        assert!(matches!(err, MemoryError::NotFound(_)));
        assert_eq!(t.store.audit_trail(&record.id).unwrap().len(), trail_len);
    }

    #[test]
    fn forget_leaves_linked_edges_orphaned() {
        let t = targets();
        let a = t.store.put(NewRecord::new("u", Scope::Persistent, "a", "v")).unwrap().record;
        let b = t.store.put(NewRecord::new("u", Scope::Persistent, "b", "v")).unwrap().record;
        t.index_record(&a, None).unwrap();
        t.index_record(&b, None).unwrap();
        t.graph.link(&a.id, &b.id, "related_to", 0.5).unwrap();

        let ack = forget_record(&t, "u", Scope::Persistent, "a").unwrap();
        assert_eq!(ack.graph.edges_orphaned, 1);
        let subgraph = t.graph.traverse(&[b.id.as_str()], 3, None).unwrap();
        assert!(subgraph.nodes.is_empty());
    }
    #[test]
    fn failed_delete_keeps_links_and_indexes() {
        let t = targets();
        let a = t
            .store
            .put(NewRecord::new("u", Scope::Persistent, "a", "alpha note"))
            .unwrap()
            .record;
        let b = t.store.put(NewRecord::new("u", Scope::Persistent, "b", "v")).unwrap().record;
        t.index_record(&a, Some(&[1.0, 0.0, 0.0])).unwrap();
        t.index_record(&b, None).unwrap();
        t.graph.link(&a.id, &b.id, "related_to", 0.5).unwrap();
        t.activation.record_access("u", &a.id, &[]);
        t.activation.record_access("u", &b.id, &[a.id.as_str()]);
        let level = t.activation.state("u", &a.id).unwrap().level;
        let strength = t.activation.co_activation("u", &a.id, &b.id);

        t.store
            .writer_handle()
            .lock()
            .unwrap()
            .execute_batch(
                "CREATE TRIGGER refuse_delete BEFORE DELETE ON memories \
                 BEGIN SELECT RAISE(ABORT, 'delete refused'); END;",
            )
            .unwrap();

        let err = forget_record(&t, "u", Scope::Persistent, "a").unwrap_err();
        assert!(matches!(err, MemoryError::Storage(_)));

        assert!(t.store.get_by_id(&a.id).unwrap().is_some());
        assert!(t.graph.get_node(&a.id).unwrap().is_some());
        let edges = t.graph.edges_of(&a.id).unwrap();
        assert_eq!(edges.len(), 1);
        assert!(!edges[0].orphaned);
        let reached = t.graph.traverse(&[a.id.as_str()], 1, None).unwrap();
        assert_eq!(reached.nodes.len(), 1);
        assert_eq!(reached.nodes[0].node.id, b.id);

        assert_eq!(t.vectors.get(&a.id).unwrap(), Some(vec![1.0, 0.0, 0.0]));
        assert!(t.lexical.contains("u", &a.id));
        assert_eq!(t.activation.state("u", &a.id).unwrap().level, level);
        assert_eq!(t.activation.co_activation("u", &b.id, &a.id), strength);

        t.store
            .writer_handle()
            .lock()
            .unwrap()
            .execute_batch("DROP TRIGGER refuse_delete;")
            .unwrap();
        let ack = forget_record(&t, "u", Scope::Persistent, "a").unwrap();
        assert_eq!(ack.graph.edges_orphaned, 1);
        assert!(t.store.get_by_id(&a.id).unwrap().is_none());
    }
}
