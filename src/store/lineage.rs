// store/lineage.rs
// Directed DAG edges between context items (invariants I9/I10), plus the
// recursive-CTE traversal used to recover canonical messages from a summary.

use rusqlite::{params, Connection};

use crate::error::Result;
use crate::model::{LineageEdge, LineageRelation, Message};

fn row_to_edge(row: &rusqlite::Row) -> rusqlite::Result<LineageEdge> {
    let relation_str: String = row.get("relation")?;
    let metadata_str: String = row.get("metadata")?;
    Ok(LineageEdge {
        parent_item_id: row.get("parent_item_id")?,
        child_item_id: row.get("child_item_id")?,
        relation: relation_str.parse().unwrap_or(LineageRelation::Derived),
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
        created_at_ms: row.get("created_at_ms")?,
    })
}

/// Insert-if-absent on the `(parent, child, relation)` primary key.
pub fn insert_edge_sync(
    conn: &Connection,
    parent_item_id: &str,
    child_item_id: &str,
    relation: LineageRelation,
    metadata: &serde_json::Value,
    now_ms: i64,
) -> Result<()> {
    let metadata_str = serde_json::to_string(metadata)?;
    conn.execute(
        "INSERT INTO lcm_lineage_edges (parent_item_id, child_item_id, relation, metadata, created_at_ms)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(parent_item_id, child_item_id, relation) DO NOTHING",
        params![parent_item_id, child_item_id, relation.to_string(), metadata_str, now_ms],
    )?;
    Ok(())
}

pub fn link_summary_to_parents_sync(
    conn: &Connection,
    summary_id: &str,
    parent_summary_ids: &[String],
    now_ms: i64,
) -> Result<()> {
    for parent_id in parent_summary_ids {
        insert_edge_sync(
            conn,
            parent_id,
            summary_id,
            LineageRelation::Derived,
            &serde_json::json!({}),
            now_ms,
        )?;
    }
    Ok(())
}

pub fn get_parents_sync(conn: &Connection, item_id: &str) -> Result<Vec<LineageEdge>> {
    let mut stmt = conn.prepare(
        "SELECT parent_item_id, child_item_id, relation, metadata, created_at_ms
         FROM lcm_lineage_edges WHERE child_item_id = ? ORDER BY created_at_ms ASC, parent_item_id ASC",
    )?;
    Ok(stmt
        .query_map(params![item_id], row_to_edge)?
        .collect::<rusqlite::Result<Vec<_>>>()?)
}

pub fn get_children_sync(conn: &Connection, item_id: &str) -> Result<Vec<LineageEdge>> {
    let mut stmt = conn.prepare(
        "SELECT parent_item_id, child_item_id, relation, metadata, created_at_ms
         FROM lcm_lineage_edges WHERE parent_item_id = ? ORDER BY created_at_ms ASC, child_item_id ASC",
    )?;
    Ok(stmt
        .query_map(params![item_id], row_to_edge)?
        .collect::<rusqlite::Result<Vec<_>>>()?)
}

/// Recursive-CTE ancestor walk from `summaryId` through `lcm_lineage_edges`,
/// collecting every canonical message reachable via a `ctxmsg_*` pointer
/// context item, ordered by ordinal.
pub fn get_summary_messages_sync(conn: &Connection, summary_id: &str, limit: usize) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "WITH RECURSIVE ancestors(item_id) AS (
            SELECT parent_item_id FROM lcm_lineage_edges WHERE child_item_id = ?1
            UNION
            SELECT le.parent_item_id
            FROM lcm_lineage_edges le
            JOIN ancestors a ON le.child_item_id = a.item_id
         )
         SELECT DISTINCT m.message_id, m.conversation_id, m.ordinal, m.role, m.author_id,
                m.content_text, m.payload, m.created_at_ms
         FROM ancestors a
         JOIN lcm_context_items ci ON ci.item_id = a.item_id
         JOIN lcm_messages m ON m.message_id = ci.source_message_id
         WHERE ci.source_message_id IS NOT NULL
         ORDER BY m.ordinal ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![summary_id, limit as i64], |row| {
            let role_str: String = row.get("role")?;
            let payload_str: String = row.get("payload")?;
            Ok(Message {
                message_id: row.get("message_id")?,
                conversation_id: row.get("conversation_id")?,
                ordinal: row.get("ordinal")?,
                role: role_str.parse().unwrap_or(crate::model::Role::User),
                author_id: row.get("author_id")?,
                content_text: row.get("content_text")?,
                payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
                created_at_ms: row.get("created_at_ms")?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}
