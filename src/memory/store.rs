//! Durable record storage. Every index is rebuilt from what lives here.
//!
//! [`RecordStore`] owns a single writer connection (all commits are serialized
//! through it, inside immediate transactions) and a reader connection. For
//! file-backed stores the reader is a separate WAL connection, so reads never
//! wait behind the write path and only ever observe committed rows.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{MemoryError, Result};
use crate::memory::types::{normalize_tags, validate_ident, validate_unit, MemoryRecord, Scope};
use crate::sync::lock;

const SELECT_COLUMNS: &str = "id, owner, scope, key, value, tags, importance, metadata, \
     embedding_id, version, access_count, last_accessed_at, created_at, updated_at";

/// Quota limits enforced on `put`.
#[derive(Debug, Clone)]
pub struct StoreLimits {
    pub max_records_per_owner: Option<u64>,
    pub max_value_bytes: usize,
}

impl Default for StoreLimits {
    fn default() -> Self {
        Self {
            max_records_per_owner: None,
            max_value_bytes: 1024 * 1024,
        }
    }
}

impl From<&crate::config::StorageConfig> for StoreLimits {
    fn from(config: &crate::config::StorageConfig) -> Self {
        Self {
            max_records_per_owner: config.max_records_per_owner,
            max_value_bytes: config.max_value_bytes,
        }
    }
}

/// A record to insert or upsert.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub owner: String,
    pub scope: Scope,
    pub key: String,
    pub value: String,
    pub tags: Vec<String>,
    pub importance: f64,
    pub metadata: serde_json::Value,
    /// Optimistic check: the write fails with `Conflict` unless the stored
    /// version equals this (`0` means "must not exist yet").
    pub expected_version: Option<u64>,
    /// Preserve a known id (import); a fresh UUID v7 is generated otherwise.
    pub id: Option<String>,
}

impl NewRecord {
    pub fn new(owner: impl Into<String>, scope: Scope, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            scope,
            key: key.into(),
            value: value.into(),
            tags: Vec::new(),
            importance: 0.5,
            metadata: serde_json::json!({}),
            expected_version: None,
            id: None,
        }
    }
}

/// Result of [`RecordStore::put`].
#[derive(Debug, Clone, Serialize)]
pub struct PutOutcome {
    pub record: MemoryRecord,
    /// Version that was replaced, `None` when the record is new.
    pub previous_version: Option<u64>,
}

/// Filters for [`RecordStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    /// All listed tags must be present.
    pub tags: Vec<String>,
    pub min_importance: Option<f64>,
    pub key_prefix: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: usize,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            offset: 0,
            limit: 50,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub next_offset: Option<usize>,
}

pub struct RecordStore {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
    limits: StoreLimits,
}

impl RecordStore {
    /// Open a file-backed store with separate writer and reader connections.
    pub fn open(path: impl AsRef<Path>, limits: StoreLimits) -> Result<Self> {
        let path = path.as_ref();
        let writer = crate::db::open_database(path)?;
        let reader = crate::db::open_reader(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(writer)),
            reader: Arc::new(Mutex::new(reader)),
            limits,
        })
    }

    /// In-memory store; reader and writer share the one connection.
    pub fn open_in_memory(limits: StoreLimits) -> Result<Self> {
        let conn = Arc::new(Mutex::new(crate::db::open_memory_database()?));
        Ok(Self {
            writer: Arc::clone(&conn),
            reader: conn,
            limits,
        })
    }

    /// Shared writer connection, for components persisting into the same file.
    pub fn writer_handle(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.writer)
    }

    pub fn reader_handle(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.reader)
    }

    fn write(&self) -> MutexGuard<'_, Connection> {
        lock(&self.writer)
    }

    fn read(&self) -> MutexGuard<'_, Connection> {
        lock(&self.reader)
    }

    /// Insert or update the record at `(owner, scope, key)`.
    ///
    /// Validates before touching storage. On update the version is bumped and
    /// `created_at`, access stats and `embedding_id` are kept.
    pub fn put(&self, new: NewRecord) -> Result<PutOutcome> {
        validate_ident("owner", &new.owner)?;
        validate_ident("key", &new.key)?;
        validate_unit("importance", new.importance)?;
        let tags = normalize_tags(&new.tags)?;
        if !new.metadata.is_object() {
            return Err(MemoryError::validation("metadata must be a JSON object"));
        }
        if new.value.len() > self.limits.max_value_bytes {
            return Err(MemoryError::Capacity(format!(
                "value is {} bytes, limit is {}",
                new.value.len(),
                self.limits.max_value_bytes
            )));
        }

        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, u64)> = tx
            .query_row(
                "SELECT id, version FROM memories WHERE owner = ?1 AND scope = ?2 AND key = ?3",
                params![new.owner, new.scope.as_str(), new.key],
                |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)),
            )
            .optional()?;

        if let Some(expected) = new.expected_version {
            let actual = existing.as_ref().map(|(_, v)| *v).unwrap_or(0);
            if actual != expected {
                return Err(MemoryError::Conflict {
                    key: format!("{}/{}/{}", new.owner, new.scope, new.key),
                    expected,
                    actual,
                });
            }
        }

        let now = ts(Utc::now());
        let tags_json = serde_json::to_string(&tags)?;
        let metadata_json = serde_json::to_string(&new.metadata)?;

        let (id, previous_version) = match existing {
            Some((id, version)) => {
                tx.execute(
                    "UPDATE memories SET value = ?1, tags = ?2, importance = ?3, metadata = ?4, \
                     version = version + 1, updated_at = ?5 WHERE id = ?6",
                    params![new.value, tags_json, new.importance, metadata_json, now, id],
                )?;
                write_audit_log(
                    &tx,
                    "update",
                    &id,
                    Some(&serde_json::json!({"previous_version": version})),
                )?;
                (id, Some(version))
            }
            None => {
                if let Some(max) = self.limits.max_records_per_owner {
                    let count: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM memories WHERE owner = ?1",
                        params![new.owner],
                        |row| row.get(0),
                    )?;
                    if count as u64 >= max {
                        return Err(MemoryError::Capacity(format!(
                            "owner {} already holds {count} records (limit {max})",
                            new.owner
                        )));
                    }
                }
                let id = new
                    .id
                    .clone()
                    .unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
                tx.execute(
                    "INSERT INTO memories (id, owner, scope, key, value, tags, importance, metadata, \
                     version, access_count, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1, 0, ?9, ?9)",
                    params![
                        id,
                        new.owner,
                        new.scope.as_str(),
                        new.key,
                        new.value,
                        tags_json,
                        new.importance,
                        metadata_json,
                        now,
                    ],
                )?;
                write_audit_log(&tx, "create", &id, None)?;
                (id, None)
            }
        };

        let record = fetch_by_id(&tx, &id)?
            .ok_or_else(|| MemoryError::not_found(format!("record vanished mid-write: {id}")))?;
        tx.commit()?;

        Ok(PutOutcome {
            record,
            previous_version,
        })
    }

    pub fn get(&self, owner: &str, scope: Scope, key: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.read();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM memories WHERE owner = ?1 AND scope = ?2 AND key = ?3"
                ),
                params![owner, scope.as_str(), key],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn get_by_id(&self, id: &str) -> Result<Option<MemoryRecord>> {
        let conn = self.read();
        fetch_by_id(&conn, id)
    }

    /// Batch-fetch records by id.
    pub fn get_many(&self, ids: &[&str]) -> Result<HashMap<String, MemoryRecord>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
        let sql = format!(
            "SELECT {SELECT_COLUMNS} FROM memories WHERE id IN ({})",
            placeholders.join(", ")
        );
        let conn = self.read();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|r| (r.id.clone(), r)).collect())
    }

    /// Delete by address. Returns `false` when nothing was there.
    pub fn delete(&self, owner: &str, scope: Scope, key: &str) -> Result<bool> {
        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let id: Option<String> = tx
            .query_row(
                "SELECT id FROM memories WHERE owner = ?1 AND scope = ?2 AND key = ?3",
                params![owner, scope.as_str(), key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(id) = id else {
            return Ok(false);
        };
        write_audit_log(
            &tx,
            "delete",
            &id,
            Some(&serde_json::json!({"owner": owner, "scope": scope, "key": key})),
        )?;
        tx.execute("DELETE FROM memories WHERE id = ?1", params![id])?;
        tx.commit()?;
        Ok(true)
    }

    /// Delete by id, logging `reason` in the audit trail.
    pub fn delete_by_id(&self, id: &str, reason: &str) -> Result<bool> {
        Ok(self.delete_by_id_with(id, reason, |_| Ok(()))?.is_some())
    }

    /// Delete by id and run `cascade` on the writer inside the same
    /// transaction. Either both land or neither does.
    ///
    /// Returns `None` (and runs nothing) when the row is already gone.
    pub fn delete_by_id_with<T>(
        &self,
        id: &str,
        reason: &str,
        cascade: impl FnOnce(&Connection) -> Result<T>,
    ) -> Result<Option<T>> {
        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if tx.execute("DELETE FROM memories WHERE id = ?1", params![id])? == 0 {
            return Ok(None);
        }
        let cascaded = cascade(&*tx)?;
        write_audit_log(&tx, "delete", id, Some(&serde_json::json!({"reason": reason})))?;
        tx.commit()?;
        Ok(Some(cascaded))
    }

    /// List one owner's records, newest update first.
    pub fn list(
        &self,
        owner: &str,
        scope: Option<Scope>,
        filter: &ListFilter,
        page: PageRequest,
    ) -> Result<Page<MemoryRecord>> {
        let mut clauses = vec!["owner = ?".to_string()];
        let mut values: Vec<Value> = vec![Value::Text(owner.to_string())];

        if let Some(scope) = scope {
            clauses.push("scope = ?".into());
            values.push(Value::Text(scope.as_str().into()));
        }
        if let Some(min) = filter.min_importance {
            clauses.push("importance >= ?".into());
            values.push(Value::Real(min));
        }
        if let Some(prefix) = &filter.key_prefix {
            clauses.push("substr(key, 1, length(?)) = ?".into());
            values.push(Value::Text(prefix.clone()));
            values.push(Value::Text(prefix.clone()));
        }
        for tag in normalize_tags(&filter.tags)? {
            clauses.push("EXISTS (SELECT 1 FROM json_each(memories.tags) WHERE json_each.value = ?)".into());
            values.push(Value::Text(tag));
        }
        let where_clause = clauses.join(" AND ");

        let conn = self.read();
        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM memories WHERE {where_clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let mut page_values = values.clone();
        page_values.push(Value::Integer(page.limit as i64));
        page_values.push(Value::Integer(page.offset as i64));
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM memories WHERE {where_clause} \
             ORDER BY updated_at DESC, id ASC LIMIT ? OFFSET ?"
        ))?;
        let items = stmt
            .query_map(params_from_iter(page_values.iter()), row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        let consumed = page.offset + items.len();
        let next_offset = ((consumed as u64) < total as u64 && !items.is_empty()).then_some(consumed);
        Ok(Page {
            items,
            total: total as u64,
            next_offset,
        })
    }

    /// Keyset page over every record (optionally one owner), ordered by id.
    /// Used by streaming export and index rebuilds.
    pub fn scan(&self, owner: Option<&str>, after_id: Option<&str>, limit: usize) -> Result<Vec<MemoryRecord>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM memories \
             WHERE (?1 IS NULL OR owner = ?1) AND (?2 IS NULL OR id > ?2) \
             ORDER BY id ASC LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![owner, after_id, limit as i64], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Session records whose last update is older than `older_than`.
    pub fn stale_session_records(&self, older_than: DateTime<Utc>) -> Result<Vec<MemoryRecord>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM memories WHERE scope = 'session' AND updated_at < ?1 \
             ORDER BY id ASC"
        ))?;
        let rows = stmt
            .query_map(params![ts(older_than)], row_to_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete session-scoped records last updated before `older_than`.
    /// Persistent records are never pruned. Returns the number deleted.
    pub fn prune(&self, older_than: DateTime<Utc>) -> Result<usize> {
        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let deleted = tx.execute(
            "DELETE FROM memories WHERE scope = 'session' AND updated_at < ?1",
            params![ts(older_than)],
        )?;
        if deleted > 0 {
            write_audit_log(
                &tx,
                "prune",
                "batch:session",
                Some(&serde_json::json!({"older_than": ts(older_than), "deleted": deleted})),
            )?;
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Atomically add `delta` to a record's importance, clamped to `[0, 1]`.
    pub fn adjust_importance(&self, id: &str, delta: f64, details: &serde_json::Value) -> Result<MemoryRecord> {
        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let updated = tx.execute(
            "UPDATE memories SET importance = MIN(1.0, MAX(0.0, importance + ?1)), updated_at = ?2 \
             WHERE id = ?3",
            params![delta, ts(Utc::now()), id],
        )?;
        if updated == 0 {
            return Err(MemoryError::not_found(format!("memory {id}")));
        }
        write_audit_log(&tx, "feedback", id, Some(details))?;
        let record = fetch_by_id(&tx, id)?.ok_or_else(|| MemoryError::not_found(format!("memory {id}")))?;
        tx.commit()?;
        Ok(record)
    }

    /// Batch update `access_count` and `last_accessed_at`.
    pub fn record_access(&self, ids: &[&str], at: DateTime<Utc>) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let now = ts(at);
        let mut conn = self.write();
        let tx = conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "UPDATE memories SET access_count = access_count + 1, last_accessed_at = ?1 WHERE id = ?2",
            )?;
            for id in ids {
                stmt.execute(params![now, id])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn set_embedding_id(&self, id: &str, embedding_id: Option<&str>) -> Result<()> {
        let conn = self.write();
        conn.execute(
            "UPDATE memories SET embedding_id = ?1 WHERE id = ?2",
            params![embedding_id, id],
        )?;
        Ok(())
    }

    pub fn count(&self, owner: Option<&str>) -> Result<u64> {
        let conn = self.read();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM memories WHERE (?1 IS NULL OR owner = ?1)",
            params![owner],
            |row| row.get(0),
        )?;
        Ok(n as u64)
    }

    /// Tag → number of the owner's records carrying it, most frequent first.
    pub fn tag_frequency(&self, owner: &str) -> Result<Vec<(String, u64)>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT json_each.value, COUNT(*) AS n FROM memories, json_each(memories.tags) \
             WHERE memories.owner = ?1 GROUP BY json_each.value ORDER BY n DESC, json_each.value ASC",
        )?;
        let rows = stmt
            .query_map(params![owner], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Append an audit entry outside of a record write (e.g. graph operations).
    pub fn audit(&self, operation: &str, subject_id: &str, details: Option<&serde_json::Value>) -> Result<()> {
        let conn = self.write();
        write_audit_log(&conn, operation, subject_id, details)
    }

    /// Audit entries for one record, oldest first.
    pub fn audit_trail(&self, subject_id: &str) -> Result<Vec<LogEntry>> {
        let conn = self.read();
        let mut stmt = conn.prepare(
            "SELECT operation, details, created_at FROM memory_log WHERE memory_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![subject_id], |row| {
                let details: Option<String> = row.get(1)?;
                Ok(LogEntry {
                    operation: row.get(0)?,
                    details: details.and_then(|s| serde_json::from_str(&s).ok()),
                    created_at: row.get(2)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub operation: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    pub created_at: String,
}

/// Fixed-width UTC timestamp so stored values compare correctly as text.
pub(crate) fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn parse_json<T: serde::de::DeserializeOwned>(idx: usize, raw: &str) -> rusqlite::Result<T> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn fetch_by_id(conn: &Connection, id: &str) -> Result<Option<MemoryRecord>> {
    let record = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM memories WHERE id = ?1"),
            params![id],
            row_to_record,
        )
        .optional()?;
    Ok(record)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let scope: String = row.get(2)?;
    let tags: String = row.get(5)?;
    let metadata: Option<String> = row.get(7)?;
    let last_accessed: Option<String> = row.get(11)?;
    let created_at: String = row.get(12)?;
    let updated_at: String = row.get(13)?;

    Ok(MemoryRecord {
        id: row.get(0)?,
        owner: row.get(1)?,
        scope: scope.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        key: row.get(3)?,
        value: row.get(4)?,
        tags: parse_json(5, &tags)?,
        importance: row.get(6)?,
        metadata: match metadata {
            Some(raw) => parse_json(7, &raw)?,
            None => serde_json::json!({}),
        },
        embedding_id: row.get(8)?,
        version: row.get::<_, i64>(9)? as u64,
        access_count: row.get::<_, i64>(10)? as u64,
        last_accessed_at: last_accessed.map(|s| parse_ts(11, &s)).transpose()?,
        created_at: parse_ts(12, &created_at)?,
        updated_at: parse_ts(13, &updated_at)?,
    })
}

/// Write an entry to the memory_log audit table.
pub(crate) fn write_audit_log(
    conn: &Connection,
    operation: &str,
    memory_id: &str,
    details: Option<&serde_json::Value>,
) -> Result<()> {
    let now = ts(Utc::now());
    let details_json = details.map(|d| d.to_string());
    conn.execute(
        "INSERT INTO memory_log (operation, memory_id, details, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![operation, memory_id, details_json, now],
    )?;
    Ok(())
}
