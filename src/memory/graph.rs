//! Knowledge graph of users, topics, memories and interactions.
//!
//! Nodes and edges live in the main database next to the records. Edges carry
//! no foreign keys: when a node is deleted its edges are either flagged
//! `orphaned` (the default) or removed, depending on [`NodeDeletePolicy`].
//! Traversal only follows live edges and tracks a visited set, so cycles and
//! stale references are harmless.

use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, TransactionBehavior};
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::config::NodeDeletePolicy;
use crate::error::{MemoryError, Result};
use crate::memory::store::{parse_ts, ts, write_audit_log};
use crate::memory::types::{
    validate_ident, validate_unit, GraphEdge, GraphNode, GraphPattern, MemoryRecord, NodeType,
    ReachedNode, Subgraph,
};
use crate::sync::lock;

const NODE_COLUMNS: &str = "id, owner, node_type, data, created_at";
const EDGE_COLUMNS: &str = "id, owner, src, dst, rel_type, weight, orphaned, created_at, updated_at";

/// A node to create.
#[derive(Debug, Clone)]
pub struct NewNode {
    /// Caller-chosen id; a UUID v7 is generated when absent.
    pub id: Option<String>,
    pub owner: String,
    pub node_type: NodeType,
    pub data: serde_json::Value,
}

/// Result of [`GraphStore::link`].
#[derive(Debug, Clone, Serialize)]
pub struct LinkOutcome {
    pub edge: GraphEdge,
    /// `false` when an existing `(src, dst, rel_type)` edge was updated.
    pub created: bool,
}

/// Result of [`GraphStore::delete_node`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct NodeDeletion {
    pub deleted: bool,
    pub edges_orphaned: usize,
    pub edges_removed: usize,
}

/// Live edges whose endpoints no longer exist.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntegrityReport {
    pub edges_checked: u64,
    pub dangling: Vec<GraphEdge>,
}

impl IntegrityReport {
    pub fn is_ok(&self) -> bool {
        self.dangling.is_empty()
    }
}

pub struct GraphStore {
    writer: Arc<Mutex<Connection>>,
    reader: Arc<Mutex<Connection>>,
    policy: NodeDeletePolicy,
}

impl GraphStore {
    /// Build on connections shared with the record store.
    pub fn new(writer: Arc<Mutex<Connection>>, reader: Arc<Mutex<Connection>>, policy: NodeDeletePolicy) -> Self {
        Self {
            writer,
            reader,
            policy,
        }
    }

    pub fn policy(&self) -> NodeDeletePolicy {
        self.policy
    }

    fn write(&self) -> MutexGuard<'_, Connection> {
        lock(&self.writer)
    }

    fn read(&self) -> MutexGuard<'_, Connection> {
        lock(&self.reader)
    }

    // ── Nodes ────────────────────────────────────────────────────────────────

    /// Create a node, or replace the data of an existing one with the same id.
    pub fn add_node(&self, node: NewNode) -> Result<GraphNode> {
        validate_ident("owner", &node.owner)?;
        if let Some(id) = &node.id {
            validate_ident("node id", id)?;
        }
        let id = node.id.unwrap_or_else(|| uuid::Uuid::now_v7().to_string());
        let data = serde_json::to_string(&node.data)?;

        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let existing: Option<(String, String)> = tx
            .query_row(
                "SELECT owner, node_type FROM graph_nodes WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match existing {
            Some((owner, _)) if owner != node.owner => {
                return Err(MemoryError::GraphIntegrity(format!(
                    "node {id} belongs to another owner"
                )));
            }
            Some((_, node_type)) if node_type != node.node_type.as_str() => {
                return Err(MemoryError::validation(format!(
                    "node {id} already exists with type {node_type}"
                )));
            }
            Some(_) => {
                tx.execute("UPDATE graph_nodes SET data = ?1 WHERE id = ?2", params![data, id])?;
            }
            None => {
                tx.execute(
                    "INSERT INTO graph_nodes (id, owner, node_type, data, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, node.owner, node.node_type.as_str(), data, ts(Utc::now())],
                )?;
            }
        }
        let created = fetch_node(&tx, &id)?
            .ok_or_else(|| MemoryError::not_found(format!("node {id}")))?;
        tx.commit()?;
        Ok(created)
    }

    /// Ensure the memory node for `record` exists, keyed by the record id.
    pub fn ensure_memory_node(&self, record: &MemoryRecord) -> Result<GraphNode> {
        self.add_node(NewNode {
            id: Some(record.id.clone()),
            owner: record.owner.clone(),
            node_type: NodeType::Memory,
            data: serde_json::json!({"key": record.key, "scope": record.scope}),
        })
    }

    pub fn get_node(&self, id: &str) -> Result<Option<GraphNode>> {
        let conn = self.read();
        fetch_node(&conn, id)
    }

    /// Delete a node, orphaning or removing its edges per the configured policy.
    pub fn delete_node(&self, id: &str) -> Result<NodeDeletion> {
        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let outcome = self.delete_node_in(&tx, id)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// [`delete_node`](Self::delete_node) on a connection the caller already
    /// holds, inside the caller's transaction. Nothing is committed here.
    pub fn delete_node_in(&self, conn: &Connection, id: &str) -> Result<NodeDeletion> {
        let deleted = conn.execute("DELETE FROM graph_nodes WHERE id = ?1", params![id])? > 0;

        let mut outcome = NodeDeletion {
            deleted,
            ..Default::default()
        };
        match self.policy {
            NodeDeletePolicy::Orphan => {
                outcome.edges_orphaned = conn.execute(
                    "UPDATE graph_edges SET orphaned = 1, updated_at = ?1 \
                     WHERE (src = ?2 OR dst = ?2) AND orphaned = 0",
                    params![ts(Utc::now()), id],
                )?;
            }
            NodeDeletePolicy::Cascade => {
                outcome.edges_removed = conn.execute(
                    "DELETE FROM graph_edges WHERE src = ?1 OR dst = ?1",
                    params![id],
                )?;
            }
        }
        if deleted {
            write_audit_log(
                conn,
                "node_delete",
                id,
                Some(&serde_json::json!({
                    "edges_orphaned": outcome.edges_orphaned,
                    "edges_removed": outcome.edges_removed,
                })),
            )?;
        }
        Ok(outcome)
    }

    // ── Edges ────────────────────────────────────────────────────────────────

    /// Create or re-weight the `(src, dst, rel_type)` edge.
    ///
    /// Both endpoints must exist and belong to the same owner.
    pub fn link(&self, src: &str, dst: &str, rel_type: &str, weight: f64) -> Result<LinkOutcome> {
        validate_ident("relation type", rel_type)?;
        validate_unit("weight", weight)?;

        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let src_node = fetch_node(&tx, src)?
            .ok_or_else(|| MemoryError::validation(format!("source node not found: {src}")))?;
        let dst_node = fetch_node(&tx, dst)?
            .ok_or_else(|| MemoryError::validation(format!("target node not found: {dst}")))?;
        if src_node.owner != dst_node.owner {
            return Err(MemoryError::GraphIntegrity(format!(
                "cannot link nodes of different owners ({src} -> {dst})"
            )));
        }

        let now = ts(Utc::now());
        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM graph_edges WHERE src = ?1 AND dst = ?2 AND rel_type = ?3",
                params![src, dst, rel_type],
                |row| row.get(0),
            )
            .optional()?;

        let (id, created) = match existing {
            Some(id) => {
                tx.execute(
                    "UPDATE graph_edges SET weight = ?1, orphaned = 0, updated_at = ?2 WHERE id = ?3",
                    params![weight, now, id],
                )?;
                (id, false)
            }
            None => {
                let id = uuid::Uuid::now_v7().to_string();
                tx.execute(
                    "INSERT INTO graph_edges (id, owner, src, dst, rel_type, weight, orphaned, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7, ?7)",
                    params![id, src_node.owner, src, dst, rel_type, weight, now],
                )?;
                (id, true)
            }
        };
        write_audit_log(
            &tx,
            "link",
            &id,
            Some(&serde_json::json!({"src": src, "dst": dst, "rel_type": rel_type, "weight": weight})),
        )?;
        let edge = fetch_edge(&tx, &id)?.ok_or_else(|| MemoryError::not_found(format!("edge {id}")))?;
        tx.commit()?;
        Ok(LinkOutcome { edge, created })
    }

    pub fn unlink(&self, src: &str, dst: &str, rel_type: &str) -> Result<bool> {
        let conn = self.write();
        let removed = conn.execute(
            "DELETE FROM graph_edges WHERE src = ?1 AND dst = ?2 AND rel_type = ?3",
            params![src, dst, rel_type],
        )?;
        Ok(removed > 0)
    }

    /// Every edge touching `id` in either direction, orphaned ones included.
    pub fn edges_of(&self, id: &str) -> Result<Vec<GraphEdge>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM graph_edges WHERE src = ?1 OR dst = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt
            .query_map(params![id], row_to_edge)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ── Traversal & analysis ─────────────────────────────────────────────────

    /// Breadth-first reachability from `seeds` over live edges in both directions.
    ///
    /// Seeds are excluded from the output and missing seeds are skipped. Each
    /// reachable node appears once, with its hop distance, in discovery order.
    pub fn traverse(&self, seeds: &[&str], depth: usize, rel_type: Option<&str>) -> Result<Subgraph> {
        let conn = self.read();
        let mut neighbors = conn.prepare_cached(&format!(
            "SELECT {EDGE_COLUMNS} FROM graph_edges \
             WHERE (src = ?1 OR dst = ?1) AND orphaned = 0 AND (?2 IS NULL OR rel_type = ?2) \
             ORDER BY created_at, id"
        ))?;

        let mut visited: HashSet<String> = HashSet::new();
        let mut seen_edges: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::new();
        let mut subgraph = Subgraph::default();

        for seed in seeds {
            if visited.contains(*seed) {
                continue;
            }
            if fetch_node(&conn, seed)?.is_some() {
                visited.insert(seed.to_string());
                queue.push_back((seed.to_string(), 0));
            } else {
                tracing::debug!(seed, "traversal seed not found, skipping");
            }
        }

        while let Some((current, hops)) = queue.pop_front() {
            if hops >= depth {
                continue;
            }
            let edges = neighbors
                .query_map(params![current, rel_type], row_to_edge)?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            for edge in edges {
                let other = if edge.src == current { &edge.dst } else { &edge.src };
                if !visited.contains(other) {
                    let Some(node) = fetch_node(&conn, other)? else {
                        // live edge to a vanished node; check_integrity reports these
                        continue;
                    };
                    visited.insert(other.clone());
                    queue.push_back((other.clone(), hops + 1));
                    subgraph.nodes.push(ReachedNode {
                        node,
                        depth: hops + 1,
                    });
                }
                if seen_edges.insert(edge.id.clone()) {
                    subgraph.edges.push(edge);
                }
            }
        }

        Ok(subgraph)
    }

    /// Sum of live edge weights touching each id. Ids without edges map to 0.
    pub fn weighted_degrees(&self, ids: &[&str]) -> Result<HashMap<String, f64>> {
        let mut degrees: HashMap<String, f64> = ids.iter().map(|id| (id.to_string(), 0.0)).collect();
        if ids.is_empty() {
            return Ok(degrees);
        }
        let placeholders: Vec<String> = (1..=ids.len()).map(|i| format!("?{i}")).collect();
        let list = placeholders.join(", ");
        let sql = format!(
            "SELECT src, dst, weight FROM graph_edges \
             WHERE orphaned = 0 AND (src IN ({list}) OR dst IN ({list}))"
        );
        let conn = self.read();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(ids.iter()), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, f64>(2)?))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for (src, dst, weight) in rows {
            if let Some(d) = degrees.get_mut(&src) {
                *d += weight;
            }
            if src != dst {
                if let Some(d) = degrees.get_mut(&dst) {
                    *d += weight;
                }
            }
        }
        Ok(degrees)
    }

    /// Aggregate structure of one owner's graph.
    pub fn analyze_patterns(&self, owner: &str) -> Result<GraphPattern> {
        let conn = self.read();
        let mut pattern = GraphPattern {
            owner: owner.to_string(),
            ..Default::default()
        };

        let mut stmt = conn.prepare(
            "SELECT node_type, COUNT(*) FROM graph_nodes WHERE owner = ?1 GROUP BY node_type",
        )?;
        for row in stmt.query_map(params![owner], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
        })? {
            let (node_type, count) = row?;
            pattern.nodes_by_type.insert(node_type, count);
        }
        pattern.interaction_nodes = pattern
            .nodes_by_type
            .get(NodeType::Interaction.as_str())
            .copied()
            .unwrap_or(0);

        let mut stmt = conn.prepare(
            "SELECT n.id, n.data, COUNT(e.id) FROM graph_nodes n \
             LEFT JOIN graph_edges e ON (e.src = n.id OR e.dst = n.id) AND e.orphaned = 0 \
             WHERE n.owner = ?1 AND n.node_type = 'topic' GROUP BY n.id",
        )?;
        for row in stmt.query_map(params![owner], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)? as u64,
            ))
        })? {
            let (id, data, count) = row?;
            let label = data
                .and_then(|d| serde_json::from_str::<serde_json::Value>(&d).ok())
                .and_then(|d| {
                    d.get("label")
                        .or_else(|| d.get("name"))
                        .and_then(|v| v.as_str().map(str::to_string))
                })
                .unwrap_or(id);
            *pattern.topic_frequency.entry(label).or_insert(0) += count;
        }

        let mut stmt = conn.prepare(
            "SELECT rel_type, COUNT(*) AS n FROM graph_edges WHERE owner = ?1 AND orphaned = 0 \
             GROUP BY rel_type ORDER BY n DESC, rel_type ASC",
        )?;
        pattern.dominant_relations = stmt
            .query_map(params![owner], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        pattern.interaction_edges = conn.query_row(
            "SELECT COUNT(DISTINCT e.id) FROM graph_edges e JOIN graph_nodes n \
             ON (n.id = e.src OR n.id = e.dst) \
             WHERE e.owner = ?1 AND e.orphaned = 0 AND n.node_type = 'interaction'",
            params![owner],
            |row| row.get::<_, i64>(0),
        )? as u64;
        pattern.orphaned_edges = conn.query_row(
            "SELECT COUNT(*) FROM graph_edges WHERE owner = ?1 AND orphaned = 1",
            params![owner],
            |row| row.get::<_, i64>(0),
        )? as u64;

        Ok(pattern)
    }

    /// Find live edges pointing at missing nodes. With `strict`, any such edge
    /// is a [`MemoryError::GraphIntegrity`] error.
    pub fn check_integrity(&self, strict: bool) -> Result<IntegrityReport> {
        let conn = self.read();
        let edges_checked: i64 =
            conn.query_row("SELECT COUNT(*) FROM graph_edges WHERE orphaned = 0", [], |row| row.get(0))?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM graph_edges e WHERE orphaned = 0 AND \
             (NOT EXISTS (SELECT 1 FROM graph_nodes WHERE id = e.src) \
              OR NOT EXISTS (SELECT 1 FROM graph_nodes WHERE id = e.dst)) \
             ORDER BY id"
        ))?;
        let dangling = stmt
            .query_map([], row_to_edge)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if strict && !dangling.is_empty() {
            return Err(MemoryError::GraphIntegrity(format!(
                "{} live edge(s) reference missing nodes",
                dangling.len()
            )));
        }
        Ok(IntegrityReport {
            edges_checked: edges_checked as u64,
            dangling,
        })
    }

    /// Permanently delete orphaned edges. Returns the number removed.
    pub fn purge_orphaned(&self, owner: Option<&str>) -> Result<usize> {
        let conn = self.write();
        let removed = conn.execute(
            "DELETE FROM graph_edges WHERE orphaned = 1 AND (?1 IS NULL OR owner = ?1)",
            params![owner],
        )?;
        Ok(removed)
    }

    // ── Bulk access for export / import ──────────────────────────────────────

    /// Keyset page of nodes ordered by id.
    pub fn scan_nodes(&self, owner: Option<&str>, after_id: Option<&str>, limit: usize) -> Result<Vec<GraphNode>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {NODE_COLUMNS} FROM graph_nodes \
             WHERE (?1 IS NULL OR owner = ?1) AND (?2 IS NULL OR id > ?2) ORDER BY id LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![owner, after_id, limit as i64], row_to_node)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn scan_edges(&self, owner: Option<&str>, after_id: Option<&str>, limit: usize) -> Result<Vec<GraphEdge>> {
        let conn = self.read();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM graph_edges \
             WHERE (?1 IS NULL OR owner = ?1) AND (?2 IS NULL OR id > ?2) ORDER BY id LIMIT ?3"
        ))?;
        let rows = stmt
            .query_map(params![owner, after_id, limit as i64], row_to_edge)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Write a node exactly as given, replacing any node with the same id.
    pub fn restore_node(&self, node: &GraphNode) -> Result<()> {
        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if let Some(existing) = fetch_node(&tx, &node.id)? {
            if existing.owner != node.owner {
                return Err(MemoryError::GraphIntegrity(format!(
                    "node {} belongs to {}, not {}",
                    node.id, existing.owner, node.owner
                )));
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO graph_nodes (id, owner, node_type, data, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                node.id,
                node.owner,
                node.node_type.as_str(),
                serde_json::to_string(&node.data)?,
                ts(node.created_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Write an edge exactly as given, replacing any edge with the same id or triple.
    ///
    /// A live edge needs both endpoints present and owned by the edge's owner,
    /// the same rules [`link`](Self::link) enforces. Orphaned edges are kept
    /// as they are.
    pub fn restore_edge(&self, edge: &GraphEdge) -> Result<()> {
        validate_ident("relation type", &edge.rel_type)?;
        validate_unit("weight", edge.weight)?;
        let mut conn = self.write();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        if !edge.orphaned {
            for endpoint in [&edge.src, &edge.dst] {
                let node = fetch_node(&tx, endpoint)?.ok_or_else(|| {
                    MemoryError::validation(format!("edge {} references missing node {endpoint}", edge.id))
                })?;
                if node.owner != edge.owner {
                    return Err(MemoryError::GraphIntegrity(format!(
                        "edge {} belongs to {} but node {endpoint} belongs to {}",
                        edge.id, edge.owner, node.owner
                    )));
                }
            }
        }
        tx.execute(
            "INSERT OR REPLACE INTO graph_edges \
             (id, owner, src, dst, rel_type, weight, orphaned, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                edge.id,
                edge.owner,
                edge.src,
                edge.dst,
                edge.rel_type,
                edge.weight,
                edge.orphaned,
                ts(edge.created_at),
                ts(edge.updated_at),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// `(nodes, live edges, orphaned edges)` for one owner or all.
    pub fn counts(&self, owner: Option<&str>) -> Result<(u64, u64, u64)> {
        let conn = self.read();
        let nodes: i64 = conn.query_row(
            "SELECT COUNT(*) FROM graph_nodes WHERE (?1 IS NULL OR owner = ?1)",
            params![owner],
            |row| row.get(0),
        )?;
        let (live, orphaned): (i64, i64) = conn.query_row(
            "SELECT COALESCE(SUM(orphaned = 0), 0), COALESCE(SUM(orphaned = 1), 0) \
             FROM graph_edges WHERE (?1 IS NULL OR owner = ?1)",
            params![owner],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok((nodes as u64, live as u64, orphaned as u64))
    }
}

fn fetch_node(conn: &Connection, id: &str) -> Result<Option<GraphNode>> {
    let node = conn
        .query_row(
            &format!("SELECT {NODE_COLUMNS} FROM graph_nodes WHERE id = ?1"),
            params![id],
            row_to_node,
        )
        .optional()?;
    Ok(node)
}

fn fetch_edge(conn: &Connection, id: &str) -> Result<Option<GraphEdge>> {
    let edge = conn
        .query_row(
            &format!("SELECT {EDGE_COLUMNS} FROM graph_edges WHERE id = ?1"),
            params![id],
            row_to_edge,
        )
        .optional()?;
    Ok(edge)
}

fn row_to_node(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphNode> {
    let node_type: String = row.get(2)?;
    let data: Option<String> = row.get(3)?;
    let created_at: String = row.get(4)?;
    Ok(GraphNode {
        id: row.get(0)?,
        owner: row.get(1)?,
        node_type: node_type.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        data: data
            .and_then(|d| serde_json::from_str(&d).ok())
            .unwrap_or(serde_json::Value::Null),
        created_at: parse_ts(4, &created_at)?,
    })
}

fn row_to_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<GraphEdge> {
    let created_at: String = row.get(7)?;
    let updated_at: String = row.get(8)?;
    Ok(GraphEdge {
        id: row.get(0)?,
        owner: row.get(1)?,
        src: row.get(2)?,
        dst: row.get(3)?,
        rel_type: row.get(4)?,
        weight: row.get(5)?,
        orphaned: row.get(6)?,
        created_at: parse_ts(7, &created_at)?,
        updated_at: parse_ts(8, &updated_at)?,
    })
}
