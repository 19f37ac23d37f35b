use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::Result;
use crate::memory::indexer::IndexerStats;

/// Number of tags listed in [`MemoryStats::top_tags`].
const TOP_TAGS: usize = 20;

/// Response from `MemoryManager::stats`.
#[derive(Debug, Serialize)]
pub struct MemoryStats {
    pub total_records: u64,
    pub by_scope: BTreeMap<String, u64>,
    pub by_owner: BTreeMap<String, u64>,
    /// Most frequent tags, only when stats are scoped to one owner.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub top_tags: Vec<(String, u64)>,
    pub graph_nodes: u64,
    pub live_edges: u64,
    pub orphaned_edges: u64,
    pub vector_backend: String,
    pub vectors: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lexical_documents: Option<u64>,
    pub indexer: IndexerStats,
    pub db_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_record: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub newest_record: Option<String>,
}

/// Counts read straight from the record database.
#[derive(Debug, Default)]
pub struct StoreCounts {
    pub total: u64,
    pub by_scope: BTreeMap<String, u64>,
    pub by_owner: BTreeMap<String, u64>,
    pub oldest: Option<String>,
    pub newest: Option<String>,
}

/// Compute record counts, optionally restricted to one owner.
pub fn store_counts(conn: &Connection, owner: Option<&str>) -> Result<StoreCounts> {
    let by_scope = count_by_scope(conn, owner)?;
    let by_owner = count_by_owner(conn, owner)?;
    let (oldest, newest) = record_time_range(conn, owner)?;
    Ok(StoreCounts {
        total: by_scope.values().sum(),
        by_scope,
        by_owner,
        oldest,
        newest,
    })
}

/// Size of the database file; `0` for in-memory stores.
pub fn db_size_bytes(db_path: Option<&Path>) -> u64 {
    db_path
        .and_then(|p| std::fs::metadata(p).ok())
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Keep the `n` most frequent tags.
pub fn top_tags(mut frequency: Vec<(String, u64)>, n: Option<usize>) -> Vec<(String, u64)> {
    frequency.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    frequency.truncate(n.unwrap_or(TOP_TAGS));
    frequency
}

fn count_by_scope(conn: &Connection, owner: Option<&str>) -> Result<BTreeMap<String, u64>> {
    let mut map = BTreeMap::new();
    for scope in ["session", "persistent"] {
        map.insert(scope.to_string(), 0);
    }

    let mut stmt = conn.prepare(
        "SELECT scope, COUNT(*) FROM memories WHERE (?1 IS NULL OR owner = ?1) GROUP BY scope",
    )?;
    let rows = stmt
        .query_map(params![owner], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for (scope, count) in rows {
        map.insert(scope, count as u64);
    }
    Ok(map)
}

fn count_by_owner(conn: &Connection, owner: Option<&str>) -> Result<BTreeMap<String, u64>> {
    let mut stmt = conn.prepare(
        "SELECT owner, COUNT(*) FROM memories WHERE (?1 IS NULL OR owner = ?1) GROUP BY owner",
    )?;
    let rows = stmt
        .query_map(params![owner], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows.into_iter().map(|(o, n)| (o, n as u64)).collect())
}

/// Oldest and newest `created_at`.
fn record_time_range(conn: &Connection, owner: Option<&str>) -> Result<(Option<String>, Option<String>)> {
    let range = conn.query_row(
        "SELECT MIN(created_at), MAX(created_at) FROM memories WHERE (?1 IS NULL OR owner = ?1)",
        params![owner],
        |row| Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?)),
    )?;
    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::store::{NewRecord, RecordStore, StoreLimits};
    use crate::memory::types::Scope;

    #[test]
    fn counts_split_by_scope_and_owner() {
        let store = RecordStore::open_in_memory(StoreLimits::default()).unwrap();
        store.put(NewRecord::new("alice", Scope::Persistent, "a", "v")).unwrap();
        store.put(NewRecord::new("alice", Scope::Session, "b", "v")).unwrap();
        store.put(NewRecord::new("bob", Scope::Persistent, "c", "v")).unwrap();

        let handle = store.reader_handle();
        let conn = handle.lock().unwrap();

        let all = store_counts(&conn, None).unwrap();
        assert_eq!(all.total, 3);
        assert_eq!(all.by_scope["persistent"], 2);
        assert_eq!(all.by_scope["session"], 1);
        assert_eq!(all.by_owner["alice"], 2);
        assert!(all.oldest.is_some());

        let bob = store_counts(&conn, Some("bob")).unwrap();
        assert_eq!(bob.total, 1);
        assert_eq!(bob.by_scope["session"], 0);
        assert_eq!(bob.by_owner.len(), 1);
    }

    #[test]
    fn empty_store_has_zeroed_scopes() {
        let store = RecordStore::open_in_memory(StoreLimits::default()).unwrap();
        let handle = store.reader_handle();
        let conn = handle.lock().unwrap();
        let counts = store_counts(&conn, None).unwrap();
        assert_eq!(counts.total, 0);
        assert_eq!(counts.by_scope.len(), 2);
        assert!(counts.oldest.is_none());
    }

    #[test]
    fn top_tags_orders_by_count_then_name() {
        let tags = vec![("b".into(), 2), ("a".into(), 2), ("c".into(), 5)];
        let top = top_tags(tags, Some(2));
        assert_eq!(top, vec![("c".to_string(), 5), ("a".to_string(), 2)]);
    }
}
