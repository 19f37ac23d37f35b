mod helpers;

use helpers::*;
use mnema::config::VectorBackend;
use mnema::memory::types::Scope;
use mnema::memory::MemoryManager;
use mnema::MemoryError;

async fn sqlite_vec_manager() -> MemoryManager {
    let mut config = test_config();
    config.vector.backend = VectorBackend::SqliteVec;
    MemoryManager::open_in_memory(config).await.unwrap()
}

#[tokio::test]
async fn second_forget_is_not_found() {
    let m = test_manager().await;
    let record = put(&m, "u1", "k", "short lived", Some(test_embedding(0))).await;

    m.forget("u1", Scope::Persistent, "k").await.unwrap();
    let err = m.forget("u1", Scope::Persistent, "k").await.unwrap_err();
    assert!(matches!(err, MemoryError::NotFound(_)));

    let trail = m.audit_trail(&record.id).await.unwrap();
    assert_eq!(trail.iter().filter(|e| e.operation == "delete").count(), 1);
}

#[tokio::test]
async fn forget_applies_pending_index_work_first() {
    let m = test_manager().await;
    put(&m, "u1", "k", "queued then forgotten", Some(test_embedding(1))).await;

    // no flush: the upsert may still be queued
    m.forget("u1", Scope::Persistent, "k").await.unwrap();
    m.flush().await.unwrap();

    assert_eq!(m.vectors().len().unwrap(), 0);
    assert_eq!(m.lexical().len("u1"), 0);
    assert_eq!(m.activation().len("u1"), 0);
}

#[tokio::test]
async fn forget_with_sqlite_vec_backend() {
    let m = sqlite_vec_manager().await;
    let keep = put(&m, "u1", "keep", "stays around", Some(test_embedding(2))).await;
    let gone = put(&m, "u1", "gone", "goes away", Some(test_embedding(3))).await;
    m.flush().await.unwrap();
    assert_eq!(m.vectors().len().unwrap(), 2);

    let ack = m.forget("u1", Scope::Persistent, "gone").await.unwrap();
    assert!(ack.vector_removed);
    assert!(ack.lexical_removed);
    assert_eq!(m.vectors().get(&gone.id).unwrap(), None);
    assert!(m.vectors().get(&keep.id).unwrap().is_some());

    let hits = m
        .recall("u1", "goes away", Some(test_embedding(3)), None, None)
        .await
        .unwrap();
    assert!(hits.iter().all(|h| h.id != gone.id));
}

#[tokio::test]
async fn forget_is_scoped_to_the_exact_address() {
    let m = test_manager().await;
    put(&m, "u1", "k", "persistent copy", None).await;
    let mut session = mnema::memory::StoreRequest::new("u1", Scope::Session, "k", "session copy");
    session.tags = vec!["scratch".into()];
    m.store(session).await.unwrap();

    m.forget("u1", Scope::Session, "k").await.unwrap();
    let remaining = m.recall_key("u1", Scope::Persistent, "k").await.unwrap();
    assert_eq!(remaining.value, "persistent copy");
    assert!(m.recall_key("u1", Scope::Session, "k").await.is_err());
}

#[tokio::test]
async fn failed_forget_leaves_graph_and_indexes_intact() {
    let m = test_manager().await;
    let a = put(&m, "u1", "a", "anchored note", Some(test_embedding(4))).await;
    let b = put(&m, "u1", "b", "linked note", None).await;
    m.flush().await.unwrap();
    m.link(&a.id, &b.id, "related_to", 0.7).await.unwrap();

    m.store_handle()
        .writer_handle()
        .lock()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER refuse_delete BEFORE DELETE ON memories \
             BEGIN SELECT RAISE(ABORT, 'delete refused'); END;",
        )
        .unwrap();

    let err = m.forget("u1", Scope::Persistent, "a").await.unwrap_err();
    assert!(matches!(err, MemoryError::Storage(_)));

    assert_eq!(m.recall_key("u1", Scope::Persistent, "a").await.unwrap().id, a.id);
    let subgraph = m.query_graph(&[a.id.clone()], 1, None).await.unwrap();
    assert_eq!(subgraph.nodes.len(), 1);
    assert_eq!(subgraph.nodes[0].node.id, b.id);
    assert!(subgraph.edges.iter().all(|e| !e.orphaned));
    assert!(m.vectors().get(&a.id).unwrap().is_some());
    assert!(m.lexical().contains("u1", &a.id));

    m.store_handle()
        .writer_handle()
        .lock()
        .unwrap()
        .execute_batch("DROP TRIGGER refuse_delete;")
        .unwrap();
    let ack = m.forget("u1", Scope::Persistent, "a").await.unwrap();
    assert!(ack.graph.deleted);
    assert_eq!(ack.graph.edges_orphaned, 1);
}
