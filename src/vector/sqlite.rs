//! Persistent vector index backed by a sqlite-vec `vec0` table.
//!
//! Vectors live in their own database file, separate from the record store,
//! so they can be dropped and rebuilt without touching durable records.
//! Vectors are L2-normalized on insert; the L2 distance `d` sqlite-vec
//! returns between unit vectors converts to cosine similarity as `1 - d²/2`.
//!
//! The owner is the table's partition key and the scope a metadata column,
//! so a KNN scan only ever ranks one owner's vectors. Tags sit in a side
//! table and are applied after the scan, overfetching until enough
//! candidates survive.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

use super::{
    bytes_to_embedding, embedding_to_bytes, normalize, sort_hits, validate_vector, VectorFilter,
    VectorIndex, VectorMetadata,
};
use crate::error::{MemoryError, Result};
use crate::sync::lock;

/// Upper bound sqlite-vec accepts for a single KNN query.
const MAX_KNN: usize = 4096;

/// Unpartitioned table written by earlier versions; migrated on open.
const LEGACY_TABLE: &str = "vectors";

const META_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS vector_meta (
    id TEXT PRIMARY KEY,
    owner TEXT NOT NULL,
    scope TEXT NOT NULL,
    tags TEXT NOT NULL DEFAULT '[]'
);

CREATE INDEX IF NOT EXISTS idx_vector_meta_owner ON vector_meta(owner);

CREATE TABLE IF NOT EXISTS vector_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

pub struct SqliteVecIndex {
    conn: Mutex<Connection>,
    dimensions: usize,
}

impl SqliteVecIndex {
    pub fn open(path: impl AsRef<Path>, dimensions: usize) -> Result<Self> {
        let path = path.as_ref();
        crate::db::load_sqlite_vec();
        crate::db::ensure_parent_dir(path)?;

        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(std::time::Duration::from_millis(5000))?;
        let index = Self::init(conn, dimensions)?;
        tracing::info!(path = %path.display(), dimensions, "vector index opened");
        Ok(index)
    }

    pub fn open_in_memory(dimensions: usize) -> Result<Self> {
        crate::db::load_sqlite_vec();
        Self::init(Connection::open_in_memory()?, dimensions)
    }

    fn init(mut conn: Connection, dimensions: usize) -> Result<Self> {
        conn.execute_batch(META_SQL)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM vector_info WHERE key = 'dimensions'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match stored.and_then(|v| v.parse::<usize>().ok()) {
            Some(existing) if existing != dimensions => {
                return Err(MemoryError::validation(format!(
                    "vector database holds {existing}-dimensional vectors, configured for {dimensions}"
                )));
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO vector_info (key, value) VALUES ('dimensions', ?1)",
                    params![dimensions.to_string()],
                )?;
            }
        }

        let tx = conn.transaction()?;
        tx.execute_batch(&format!(
            "CREATE VIRTUAL TABLE IF NOT EXISTS vectors_by_owner USING vec0(\
                id TEXT PRIMARY KEY, \
                owner TEXT PARTITION KEY, \
                scope TEXT, \
                embedding FLOAT[{dimensions}]\
            );"
        ))?;
        let legacy: bool = tx.query_row(
            "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type = 'table' AND name = ?1",
            params![LEGACY_TABLE],
            |row| row.get(0),
        )?;
        if legacy {
            let moved = tx.execute(
                &format!(
                    "INSERT INTO vectors_by_owner (id, owner, scope, embedding) \
                     SELECT v.id, m.owner, m.scope, v.embedding \
                     FROM {LEGACY_TABLE} v JOIN vector_meta m ON m.id = v.id"
                ),
                [],
            )?;
            tx.execute_batch(&format!("DROP TABLE {LEGACY_TABLE};"))?;
            tracing::info!(moved, "vectors migrated to per-owner partitions");
        }
        tx.commit()?;

        Ok(Self {
            conn: Mutex::new(conn),
            dimensions,
        })
    }

    /// Version string reported by the loaded sqlite-vec extension.
    pub fn vec_version(&self) -> Result<String> {
        let conn = lock(&self.conn);
        Ok(conn.query_row("SELECT vec_version()", [], |row| row.get(0))?)
    }

    /// Nearest `limit` vectors within one owner's partition, optionally one scope.
    fn knn(
        conn: &Connection,
        query: &[u8],
        limit: usize,
        owner: &str,
        scope: Option<&str>,
    ) -> Result<Vec<(String, f64)>> {
        let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<(String, f64)> {
            Ok((row.get(0)?, row.get(1)?))
        };
        let rows = match scope {
            Some(scope) => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, distance FROM vectors_by_owner \
                     WHERE embedding MATCH ?1 AND k = ?2 AND owner = ?3 AND scope = ?4 ORDER BY distance",
                )?;
                let rows = stmt
                    .query_map(params![query, limit as i64, owner, scope], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let mut stmt = conn.prepare_cached(
                    "SELECT id, distance FROM vectors_by_owner \
                     WHERE embedding MATCH ?1 AND k = ?2 AND owner = ?3 ORDER BY distance",
                )?;
                let rows = stmt
                    .query_map(params![query, limit as i64, owner], map_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(rows)
    }

    fn metadata(conn: &Connection, id: &str) -> Result<Option<VectorMetadata>> {
        let mut stmt =
            conn.prepare_cached("SELECT owner, scope, tags FROM vector_meta WHERE id = ?1")?;
        let row: Option<(String, String, String)> = stmt
            .query_row(params![id], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
            .optional()?;
        let Some((owner, scope, tags)) = row else {
            return Ok(None);
        };
        Ok(Some(VectorMetadata {
            owner,
            scope: scope.parse().map_err(MemoryError::indexing)?,
            tags: serde_json::from_str(&tags)?,
        }))
    }
}

impl VectorIndex for SqliteVecIndex {
    fn backend(&self) -> &'static str {
        "sqlite_vec"
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }

    fn upsert(&self, id: &str, vector: &[f32], metadata: VectorMetadata) -> Result<()> {
        validate_vector(vector, self.dimensions)?;
        let unit = normalize(vector);
        let tags = serde_json::to_string(&metadata.tags)?;

        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        // vec0 has no upsert; replace by delete + insert
        tx.execute("DELETE FROM vectors_by_owner WHERE id = ?1", params![id])?;
        tx.execute(
            "INSERT INTO vectors_by_owner (id, owner, scope, embedding) VALUES (?1, ?2, ?3, ?4)",
            params![id, metadata.owner, metadata.scope.as_str(), embedding_to_bytes(&unit)],
        )?;
        tx.execute(
            "INSERT OR REPLACE INTO vector_meta (id, owner, scope, tags) VALUES (?1, ?2, ?3, ?4)",
            params![id, metadata.owner, metadata.scope.as_str(), tags],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn query(&self, vector: &[f32], k: usize, filter: &VectorFilter) -> Result<Vec<(String, f64)>> {
        validate_vector(vector, self.dimensions)?;
        if k == 0 {
            return Ok(Vec::new());
        }
        let unit = normalize(vector);
        let bytes = embedding_to_bytes(&unit);

        let scope = filter.scope.map(|s| s.as_str());
        let conn = lock(&self.conn);
        let total: i64 = conn.query_row(
            "SELECT COUNT(*) FROM vector_meta WHERE owner = ?1 AND (?2 IS NULL OR scope = ?2)",
            params![filter.owner, scope],
            |row| row.get(0),
        )?;
        let ceiling = (total as usize).min(MAX_KNN);
        if ceiling == 0 {
            return Ok(Vec::new());
        }

        let mut fetch = (k * 4).max(k + 16).min(ceiling);
        loop {
            let mut hits = Vec::with_capacity(k);
            for (id, distance) in Self::knn(&conn, bytes, fetch, &filter.owner, scope)? {
                let Some(meta) = Self::metadata(&conn, &id)? else {
                    continue;
                };
                if filter.matches(&meta) {
                    let similarity = (1.0 - distance * distance / 2.0).clamp(-1.0, 1.0);
                    hits.push((id, similarity));
                }
            }
            if hits.len() >= k || fetch >= ceiling {
                sort_hits(&mut hits, k);
                return Ok(hits);
            }
            fetch = (fetch * 2).min(ceiling);
        }
    }

    fn delete(&self, id: &str) -> Result<bool> {
        let mut conn = lock(&self.conn);
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM vectors_by_owner WHERE id = ?1", params![id])?;
        let removed = tx.execute("DELETE FROM vector_meta WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(removed > 0)
    }

    fn get(&self, id: &str) -> Result<Option<Vec<f32>>> {
        let conn = lock(&self.conn);
        let bytes: Option<Vec<u8>> = conn
            .query_row(
                "SELECT embedding FROM vectors_by_owner WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes.map(|b| bytes_to_embedding(&b)))
    }

    fn len(&self) -> Result<usize> {
        let conn = lock(&self.conn);
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM vector_meta", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn version(&self) -> Option<String> {
        self.vec_version().ok()
    }
}
