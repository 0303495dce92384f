// store/conversation.rs
// Conversation rows: created on first ingest, never deleted by the core.

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::model::Conversation;

fn row_to_conversation(row: &rusqlite::Row) -> rusqlite::Result<Conversation> {
    Ok(Conversation {
        conversation_id: row.get("conversation_id")?,
        session_id: row.get("session_id")?,
        channel: row.get("channel")?,
        created_at_ms: row.get("created_at_ms")?,
        updated_at_ms: row.get("updated_at_ms")?,
    })
}

pub fn get_conversation_sync(conn: &Connection, conversation_id: &str) -> Result<Option<Conversation>> {
    let conv = conn
        .query_row(
            "SELECT conversation_id, session_id, channel, created_at_ms, updated_at_ms
             FROM lcm_conversations WHERE conversation_id = ?",
            params![conversation_id],
            row_to_conversation,
        )
        .optional()?;
    Ok(conv)
}

/// Insert the conversation if absent; otherwise return the existing row
/// unchanged. Never mutates `sessionId`/`channel` of an existing conversation.
pub fn ensure_conversation_sync(
    conn: &Connection,
    conversation_id: &str,
    session_id: &str,
    channel: Option<&str>,
    now_ms: i64,
) -> Result<Conversation> {
    if let Some(existing) = get_conversation_sync(conn, conversation_id)? {
        return Ok(existing);
    }

    conn.execute(
        "INSERT INTO lcm_conversations (conversation_id, session_id, channel, created_at_ms, updated_at_ms)
         VALUES (?, ?, ?, ?, ?)
         ON CONFLICT(conversation_id) DO NOTHING",
        params![conversation_id, session_id, channel, now_ms, now_ms],
    )?;

    get_conversation_sync(conn, conversation_id)?
        .ok_or_else(|| crate::error::LcmError::Other("conversation insert did not persist".into()))
}

pub fn touch_conversation_sync(conn: &Connection, conversation_id: &str, now_ms: i64) -> Result<()> {
    conn.execute(
        "UPDATE lcm_conversations SET updated_at_ms = ? WHERE conversation_id = ? AND updated_at_ms < ?",
        params![now_ms, conversation_id, now_ms],
    )?;
    Ok(())
}
