// store/context_items.rs
// Context items: the pointer-or-inline entries that make up the active
// context chain (invariants I6-I8), plus compaction's range-replace op.

use rusqlite::{params, Connection, OptionalExtension};

use super::{ctx_msg_pointer_id, lineage};
use crate::db::migration_helpers::table_exists;
use crate::error::{LcmError, Result};
use crate::model::{ContextItem, ContextItemKind, LineageRelation};

/// Keeps the optional `lcm_context_items_fts` shadow table in lockstep with a
/// summary insert, indexing `title||body` per spec §4.1. A no-op when this
/// SQLite build lacks FTS5 (the backend never created the virtual table) —
/// substring search then carries the whole load, per spec §4.1's fallback
/// contract.
fn index_summary_for_fts(conn: &Connection, item_id: &str, title: Option<&str>, body: &str) -> Result<()> {
    if !table_exists(conn, "lcm_context_items_fts") {
        return Ok(());
    }
    conn.execute(
        "INSERT INTO lcm_context_items_fts (item_id, title, body) VALUES (?, ?, ?)",
        params![item_id, title.unwrap_or(""), body],
    )?;
    Ok(())
}

/// Input to [`insert_summary_sync`]. Callers generate `item_id` themselves
/// (typically a fresh UUID) since summary ids are referenced before the row
/// exists (lineage edges are inserted in the same transaction).
#[derive(Debug, Clone)]
pub struct NewContextItem {
    pub item_id: String,
    pub conversation_id: String,
    pub depth: i64,
    pub title: Option<String>,
    pub body: String,
    pub metadata: serde_json::Value,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Parameters for [`replace_context_range_with_summary_sync`].
#[derive(Debug, Clone)]
pub struct ReplaceRangeParams {
    pub conversation_id: String,
    pub summary_id: String,
    pub start_item_id: String,
    pub end_item_id: String,
    pub updated_at_ms: i64,
    pub metadata: serde_json::Value,
}

fn row_to_item(row: &rusqlite::Row) -> rusqlite::Result<ContextItem> {
    let item_type_str: String = row.get("item_type")?;
    let metadata_str: String = row.get("metadata")?;
    let tombstoned: i64 = row.get("tombstoned")?;
    Ok(ContextItem {
        item_id: row.get("item_id")?,
        conversation_id: row.get("conversation_id")?,
        source_message_id: row.get("source_message_id")?,
        item_type: item_type_str.parse().unwrap_or(ContextItemKind::Note),
        depth: row.get("depth")?,
        title: row.get("title")?,
        body: row.get("body")?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
        tombstoned: tombstoned != 0,
        created_at_ms: row.get("created_at_ms")?,
        updated_at_ms: row.get("updated_at_ms")?,
    })
}

pub fn get_context_item_sync(conn: &Connection, item_id: &str) -> Result<Option<ContextItem>> {
    Ok(conn
        .query_row(
            "SELECT item_id, conversation_id, source_message_id, item_type, depth, title, body,
                    metadata, tombstoned, created_at_ms, updated_at_ms
             FROM lcm_context_items WHERE item_id = ?",
            params![item_id],
            row_to_item,
        )
        .optional()?)
}

/// Ensures the deterministic `ctxmsg_*` pointer item exists for a message,
/// inserting it if absent. Any two calls with the same
/// `(conversationId, messageId)` yield the same item (spec §4.3).
pub fn append_context_message_sync(
    conn: &Connection,
    conversation_id: &str,
    message_id: &str,
    now_ms: i64,
) -> Result<ContextItem> {
    let item_id = ctx_msg_pointer_id(conversation_id, message_id);
    if let Some(existing) = get_context_item_sync(conn, &item_id)? {
        return Ok(existing);
    }

    let message_exists: bool = conn
        .query_row(
            "SELECT 1 FROM lcm_messages WHERE message_id = ?",
            params![message_id],
            |_| Ok(true),
        )
        .optional()?
        .unwrap_or(false);
    if !message_exists {
        return Err(LcmError::InvalidInput(format!(
            "cannot append context pointer: message {message_id} does not exist"
        )));
    }

    conn.execute(
        "INSERT INTO lcm_context_items
            (item_id, conversation_id, source_message_id, item_type, depth, title, body, metadata, tombstoned, created_at_ms, updated_at_ms)
         VALUES (?, ?, ?, 'message', 0, NULL, '', '{}', 0, ?, ?)
         ON CONFLICT(item_id) DO NOTHING",
        params![item_id, conversation_id, message_id, now_ms, now_ms],
    )?;

    get_context_item_sync(conn, &item_id)?
        .ok_or_else(|| LcmError::Other("context item insert did not persist".into()))
}

/// Insert-if-absent for a summary context item, keyed by caller-supplied `item_id`.
pub fn insert_summary_sync(conn: &Connection, item: &NewContextItem) -> Result<ContextItem> {
    if let Some(existing) = get_context_item_sync(conn, &item.item_id)? {
        return Ok(existing);
    }

    let metadata_str = serde_json::to_string(&item.metadata)?;
    conn.execute(
        "INSERT INTO lcm_context_items
            (item_id, conversation_id, source_message_id, item_type, depth, title, body, metadata, tombstoned, created_at_ms, updated_at_ms)
         VALUES (?, ?, NULL, 'summary', ?, ?, ?, ?, 0, ?, ?)
         ON CONFLICT(item_id) DO NOTHING",
        params![
            item.item_id,
            item.conversation_id,
            item.depth,
            item.title,
            item.body,
            metadata_str,
            item.created_at_ms,
            item.updated_at_ms,
        ],
    )?;

    index_summary_for_fts(conn, &item.item_id, item.title.as_deref(), &item.body)?;

    get_context_item_sync(conn, &item.item_id)?
        .ok_or_else(|| LcmError::Other("summary insert did not persist".into()))
}

/// Links a summary to its direct message sources via the deterministic
/// `ctxmsg_*` pointers, creating those pointers if needed, then inserting
/// `summarizes` edges from each pointer to the summary.
pub fn link_summary_to_messages_sync(
    conn: &Connection,
    summary_id: &str,
    conversation_id: &str,
    message_ids: &[String],
    now_ms: i64,
) -> Result<()> {
    for message_id in message_ids {
        let pointer = append_context_message_sync(conn, conversation_id, message_id, now_ms)?;
        lineage::insert_edge_sync(
            conn,
            &pointer.item_id,
            summary_id,
            LineageRelation::Summarizes,
            &serde_json::json!({}),
            now_ms,
        )?;
    }
    Ok(())
}

/// Tombstones every active item in `[min(start,end), max(start,end)]` by
/// `createdAtMs` (excluding the summary itself) and links each to the
/// summary with a `compacted` edge. Runs as one statement set; callers wrap
/// this in a transaction to get atomicity across summary insert + edges.
pub fn replace_context_range_with_summary_sync(
    conn: &Connection,
    params: &ReplaceRangeParams,
) -> Result<usize> {
    let start_ts: i64 = conn.query_row(
        "SELECT created_at_ms FROM lcm_context_items WHERE item_id = ?",
        rusqlite::params![params.start_item_id],
        |r| r.get(0),
    )?;
    let end_ts: i64 = conn.query_row(
        "SELECT created_at_ms FROM lcm_context_items WHERE item_id = ?",
        rusqlite::params![params.end_item_id],
        |r| r.get(0),
    )?;
    let (lo, hi) = if start_ts <= end_ts {
        (start_ts, end_ts)
    } else {
        (end_ts, start_ts)
    };

    let mut stmt = conn.prepare(
        "SELECT item_id FROM lcm_context_items
         WHERE conversation_id = ?1 AND tombstoned = 0 AND item_id != ?2
           AND created_at_ms BETWEEN ?3 AND ?4",
    )?;
    let target_ids: Vec<String> = stmt
        .query_map(
            rusqlite::params![params.conversation_id, params.summary_id, lo, hi],
            |r| r.get(0),
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    drop(stmt);

    let edge_metadata = serde_json::to_string(&params.metadata)?;
    for item_id in &target_ids {
        conn.execute(
            "UPDATE lcm_context_items SET tombstoned = 1, updated_at_ms = ? WHERE item_id = ?",
            rusqlite::params![params.updated_at_ms, item_id],
        )?;
        conn.execute(
            "INSERT INTO lcm_lineage_edges (parent_item_id, child_item_id, relation, metadata, created_at_ms)
             VALUES (?, ?, 'compacted', ?, ?)
             ON CONFLICT(parent_item_id, child_item_id, relation) DO NOTHING",
            rusqlite::params![item_id, params.summary_id, edge_metadata, params.updated_at_ms],
        )?;
    }

    Ok(target_ids.len())
}

pub fn get_context_items_sync(
    conn: &Connection,
    conversation_id: &str,
    include_tombstoned: bool,
    item_types: Option<&[ContextItemKind]>,
    limit: Option<usize>,
) -> Result<Vec<ContextItem>> {
    let mut sql = String::from(
        "SELECT item_id, conversation_id, source_message_id, item_type, depth, title, body,
                metadata, tombstoned, created_at_ms, updated_at_ms
         FROM lcm_context_items WHERE conversation_id = ?1",
    );
    if !include_tombstoned {
        sql.push_str(" AND tombstoned = 0");
    }
    if let Some(types) = item_types {
        if types.is_empty() {
            return Ok(Vec::new());
        }
        let list = types
            .iter()
            .map(|t| format!("'{}'", t))
            .collect::<Vec<_>>()
            .join(", ");
        sql.push_str(&format!(" AND item_type IN ({list})"));
    }
    sql.push_str(" ORDER BY created_at_ms ASC, item_id ASC");
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(params![conversation_id], row_to_item)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::migrations;
    use crate::model::Role;
    use crate::store::{conversation, messages, NewMessage};

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        migrations::run_all(&conn).unwrap();
        conversation::ensure_conversation_sync(&conn, "c1", "s1", None, 0).unwrap();
        conn
    }

    fn seed_message(conn: &Connection, id: &str, ordinal: i64) {
        messages::create_message_sync(
            conn,
            &NewMessage {
                message_id: id.into(),
                conversation_id: "c1".into(),
                ordinal,
                role: Role::User,
                author_id: None,
                content_text: "hi".into(),
                payload: serde_json::json!({}),
                created_at_ms: ordinal,
            },
        )
        .unwrap();
    }

    #[test]
    fn test_append_context_message_idempotent() {
        let conn = setup();
        seed_message(&conn, "m0", 0);
        let a = append_context_message_sync(&conn, "c1", "m0", 0).unwrap();
        let b = append_context_message_sync(&conn, "c1", "m0", 5).unwrap();
        assert_eq!(a.item_id, b.item_id);
        assert_eq!(a.created_at_ms, b.created_at_ms);
    }

    #[test]
    fn test_append_context_message_requires_existing_message() {
        let conn = setup();
        let result = append_context_message_sync(&conn, "c1", "ghost", 0);
        assert!(result.is_err());
    }

    #[test]
    fn test_replace_range_tombstones_and_links_compacted() {
        let conn = setup();
        for i in 0..3 {
            seed_message(&conn, &format!("m{i}"), i);
            append_context_message_sync(&conn, "c1", &format!("m{i}"), i).unwrap();
        }

        let summary = insert_summary_sync(
            &conn,
            &NewContextItem {
                item_id: "sum1".into(),
                conversation_id: "c1".into(),
                depth: 1,
                title: None,
                body: "summary".into(),
                metadata: serde_json::json!({}),
                created_at_ms: 10,
                updated_at_ms: 10,
            },
        )
        .unwrap();

        let start_id = ctx_msg_pointer_id("c1", "m0");
        let end_id = ctx_msg_pointer_id("c1", "m2");

        let count = replace_context_range_with_summary_sync(
            &conn,
            &ReplaceRangeParams {
                conversation_id: "c1".into(),
                summary_id: summary.item_id.clone(),
                start_item_id: start_id,
                end_item_id: end_id,
                updated_at_ms: 20,
                metadata: serde_json::json!({}),
            },
        )
        .unwrap();
        assert_eq!(count, 3);

        let active = get_context_items_sync(&conn, "c1", false, None, None).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].item_id, summary.item_id);
    }
}
