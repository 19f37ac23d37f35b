pub mod migrations;
pub mod schema;

use rusqlite::{Connection, OpenFlags};
use serde::Serialize;
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::Once;
use std::time::Duration;

use crate::error::Result;

static SQLITE_VEC_INIT: Once = Once::new();

const BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Register the sqlite-vec extension globally. Safe to call multiple times.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(
            sqlite3_vec_init as *const (),
        )));
    });
}

pub(crate) fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Open (or create) the record database at the given path, with schema
/// initialized and migrations applied. This is the writer connection.
pub fn open_database(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    ensure_parent_dir(path)?;

    let mut conn = Connection::open(path)?;

    // WAL lets the reader connection proceed while a write is in flight
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.busy_timeout(BUSY_TIMEOUT)?;

    schema::init_schema(&conn)?;
    migrations::run_migrations(&mut conn)?;

    tracing::info!(path = %path.display(), "database initialized");
    Ok(conn)
}

/// Open a read-only connection to an already-initialized database.
pub fn open_reader(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open_with_flags(
        path.as_ref(),
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX | OpenFlags::SQLITE_OPEN_URI,
    )?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    Ok(conn)
}

/// Open an in-memory database with schema and migrations applied.
pub fn open_memory_database() -> Result<Connection> {
    let mut conn = Connection::open_in_memory()?;
    schema::init_schema(&conn)?;
    migrations::run_migrations(&mut conn)?;
    Ok(conn)
}

/// Result of [`check_database_health`].
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub integrity_ok: bool,
    pub integrity_details: String,
    pub schema_version: u32,
    pub vector_dimensions: Option<usize>,
    pub memory_count: u64,
    pub node_count: u64,
    pub edge_count: u64,
    pub orphaned_edge_count: u64,
    pub log_count: u64,
}

/// Run `PRAGMA integrity_check` and collect row counts.
pub fn check_database_health(conn: &Connection) -> Result<HealthReport> {
    let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
    let count = |sql: &str| -> Result<u64> {
        let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
        Ok(n as u64)
    };

    Ok(HealthReport {
        integrity_ok: integrity == "ok",
        integrity_details: integrity,
        schema_version: migrations::get_schema_version(conn)?,
        vector_dimensions: migrations::get_vector_dimensions(conn)?,
        memory_count: count("SELECT COUNT(*) FROM memories")?,
        node_count: count("SELECT COUNT(*) FROM graph_nodes")?,
        edge_count: count("SELECT COUNT(*) FROM graph_edges")?,
        orphaned_edge_count: count("SELECT COUNT(*) FROM graph_edges WHERE orphaned = 1")?,
        log_count: count("SELECT COUNT(*) FROM memory_log")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_check_on_fresh_db() {
        let conn = open_memory_database().unwrap();
        let report = check_database_health(&conn).unwrap();
        assert!(report.integrity_ok);
        assert_eq!(report.schema_version, migrations::CURRENT_SCHEMA_VERSION);
        assert_eq!(report.memory_count, 0);
        assert_eq!(report.edge_count, 0);
    }

    #[test]
    fn reader_sees_committed_rows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("mem.db");
        let writer = open_database(&path).unwrap();
        writer
            .execute(
                "INSERT INTO schema_meta (key, value) VALUES ('sample', 'yes')",
                [],
            )
            .unwrap();

        let reader = open_reader(&path).unwrap();
        let value: String = reader
            .query_row("SELECT value FROM schema_meta WHERE key = 'sample'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(value, "yes");
    }
}
