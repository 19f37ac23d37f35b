mod helpers;

use helpers::*;
use mnema::db::migrations::{get_schema_version, run_migrations, CURRENT_SCHEMA_VERSION};
use mnema::db::{check_database_health, open_database, open_reader};
use mnema::memory::MemoryManager;
use mnema::MemoryError;
use tempfile::TempDir;

#[test]
fn open_database_creates_nested_path() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("deep").join("nested").join("memory.db");
    assert!(!path.exists());

    let conn = open_database(&path).unwrap();
    assert!(path.exists());

    let mode: String = conn.query_row("PRAGMA journal_mode", [], |r| r.get(0)).unwrap();
    assert_eq!(mode.to_lowercase(), "wal");
}

#[test]
fn busy_timeout_is_configured() {
    let tmp = TempDir::new().unwrap();
    let conn = open_database(tmp.path().join("memory.db")).unwrap();
    let timeout: i64 = conn.query_row("PRAGMA busy_timeout", [], |r| r.get(0)).unwrap();
    assert_eq!(timeout, 5000);
}

#[test]
fn fresh_database_is_healthy_and_current() {
    let conn = test_db();
    let report = check_database_health(&conn).unwrap();
    assert!(report.integrity_ok);
    assert_eq!(report.schema_version, CURRENT_SCHEMA_VERSION);
    assert_eq!(report.memory_count, 0);
    assert_eq!(report.node_count, 0);
    assert_eq!(report.log_count, 0);
    assert_eq!(report.vector_dimensions, None);
}

#[test]
fn reopening_does_not_rerun_migrations() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("memory.db");
    drop(open_database(&path).unwrap());

    let mut conn = open_database(&path).unwrap();
    run_migrations(&mut conn).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
}

#[test]
fn version_one_database_is_upgraded() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("memory.db");
    {
        let conn = open_database(&path).unwrap();
        conn.execute_batch(
            "DROP INDEX idx_memories_scope_updated;
             UPDATE schema_meta SET value = '1' WHERE key = 'schema_version';",
        )
        .unwrap();
    }

    let conn = open_database(&path).unwrap();
    assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
    let has_index: bool = conn
        .query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE name = 'idx_memories_scope_updated'",
            [],
            |r| r.get(0),
        )
        .unwrap();
    assert!(has_index);
}

#[test]
fn reader_connection_rejects_writes() {
    let tmp = TempDir::new().unwrap();
    let path = tmp.path().join("memory.db");
    let _writer = open_database(&path).unwrap();
    let reader = open_reader(&path).unwrap();
    let result = reader.execute("INSERT INTO schema_meta (key, value) VALUES ('x', 'y')", []);
    assert!(result.is_err());
}

#[tokio::test]
async fn manager_records_vector_dimensions_once() {
    let tmp = TempDir::new().unwrap();
    let config = file_config(tmp.path());

    let m = MemoryManager::open(config.clone()).await.unwrap();
    let health = m.health().await.unwrap();
    assert_eq!(health.database.vector_dimensions, Some(DIMS));
    assert!(health.graph.is_ok());
    m.shutdown().await.unwrap();
    drop(m);

    let mut wider = config;
    wider.vector.dimensions = DIMS * 2;
    let err = MemoryManager::open(wider).await.err().unwrap();
    assert!(matches!(err, MemoryError::Validation(_)));
}
