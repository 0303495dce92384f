// store/messages.rs
// Canonical, append-only messages and their parts (invariants I1-I5).

use rusqlite::{params, Connection, OptionalExtension};

use super::{NewMessage, NewMessagePart};
use crate::error::Result;
use crate::model::{Message, MessagePart, PartKind, Role};

fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<Message> {
    let role_str: String = row.get("role")?;
    let payload_str: String = row.get("payload")?;
    Ok(Message {
        message_id: row.get("message_id")?,
        conversation_id: row.get("conversation_id")?,
        ordinal: row.get("ordinal")?,
        role: role_str.parse().unwrap_or(Role::User),
        author_id: row.get("author_id")?,
        content_text: row.get("content_text")?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        created_at_ms: row.get("created_at_ms")?,
    })
}

fn row_to_part(row: &rusqlite::Row) -> rusqlite::Result<MessagePart> {
    let kind_str: String = row.get("kind")?;
    let payload_str: String = row.get("payload")?;
    Ok(MessagePart {
        part_id: row.get("part_id")?,
        message_id: row.get("message_id")?,
        part_index: row.get("part_index")?,
        kind: PartKind::from_stored(&kind_str),
        mime_type: row.get("mime_type")?,
        text_content: row.get("text_content")?,
        blob_path: row.get("blob_path")?,
        token_count: row.get("token_count")?,
        payload: serde_json::from_str(&payload_str).unwrap_or(serde_json::Value::Null),
        created_at_ms: row.get("created_at_ms")?,
    })
}

fn get_message_by_id_sync(conn: &Connection, message_id: &str) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            "SELECT message_id, conversation_id, ordinal, role, author_id, content_text, payload, created_at_ms
             FROM lcm_messages WHERE message_id = ?",
            params![message_id],
            row_to_message,
        )
        .optional()?)
}

fn get_message_by_ordinal_sync(
    conn: &Connection,
    conversation_id: &str,
    ordinal: i64,
) -> Result<Option<Message>> {
    Ok(conn
        .query_row(
            "SELECT message_id, conversation_id, ordinal, role, author_id, content_text, payload, created_at_ms
             FROM lcm_messages WHERE conversation_id = ? AND ordinal = ?",
            params![conversation_id, ordinal],
            row_to_message,
        )
        .optional()?)
}

/// Next free ordinal for `conversation_id`, for callers that assign ordinals
/// themselves rather than accepting a caller-supplied one.
pub fn next_ordinal_sync(conn: &Connection, conversation_id: &str) -> Result<i64> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(ordinal), -1) + 1 FROM lcm_messages WHERE conversation_id = ?",
        params![conversation_id],
        |r| r.get(0),
    )?;
    Ok(next)
}

/// Idempotent insert keyed by `messageId`; if `(conversationId, ordinal)`
/// already exists it returns that existing row instead (invariant I3).
pub fn create_message_sync(conn: &Connection, input: &NewMessage) -> Result<Message> {
    if let Some(existing) = get_message_by_id_sync(conn, &input.message_id)? {
        return Ok(existing);
    }
    if let Some(existing) =
        get_message_by_ordinal_sync(conn, &input.conversation_id, input.ordinal)?
    {
        return Ok(existing);
    }

    let payload = serde_json::to_string(&input.payload)?;
    conn.execute(
        "INSERT INTO lcm_messages
            (message_id, conversation_id, ordinal, role, author_id, content_text, payload, created_at_ms)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(conversation_id, ordinal) DO NOTHING",
        params![
            input.message_id,
            input.conversation_id,
            input.ordinal,
            input.role.to_string(),
            input.author_id,
            input.content_text,
            payload,
            input.created_at_ms,
        ],
    )?;
    conn.execute(
        "UPDATE lcm_conversations SET updated_at_ms = ? WHERE conversation_id = ? AND updated_at_ms < ?",
        params![input.created_at_ms, input.conversation_id, input.created_at_ms],
    )?;

    if let Some(row) = get_message_by_id_sync(conn, &input.message_id)? {
        return Ok(row);
    }
    get_message_by_ordinal_sync(conn, &input.conversation_id, input.ordinal)?
        .ok_or_else(|| crate::error::LcmError::Other("message insert did not persist".into()))
}

/// Insert parts sorted by `partIndex`, insert-if-absent per `(messageId, partIndex)`.
pub fn create_message_parts_sync(
    conn: &Connection,
    message_id: &str,
    mut parts: Vec<NewMessagePart>,
) -> Result<Vec<MessagePart>> {
    parts.sort_by_key(|p| p.part_index);

    for part in &parts {
        let payload = serde_json::to_string(&part.payload)?;
        conn.execute(
            "INSERT INTO lcm_message_parts
                (part_id, message_id, part_index, kind, mime_type, text_content, blob_path, token_count, payload, created_at_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(message_id, part_index) DO NOTHING",
            params![
                part.part_id,
                message_id,
                part.part_index,
                part.kind.as_stored(),
                part.mime_type,
                part.text_content,
                part.blob_path,
                part.token_count,
                payload,
                part.created_at_ms,
            ],
        )?;
    }

    list_message_parts_sync(conn, message_id)
}

pub fn list_message_parts_sync(conn: &Connection, message_id: &str) -> Result<Vec<MessagePart>> {
    let mut stmt = conn.prepare(
        "SELECT part_id, message_id, part_index, kind, mime_type, text_content, blob_path, token_count, payload, created_at_ms
         FROM lcm_message_parts WHERE message_id = ? ORDER BY part_index ASC",
    )?;
    let rows = stmt
        .query_map(params![message_id], row_to_part)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

pub fn list_messages_sync(
    conn: &Connection,
    conversation_id: &str,
    message_ids: Option<&[String]>,
    limit: Option<usize>,
    descending: bool,
) -> Result<Vec<Message>> {
    let order = if descending { "DESC" } else { "ASC" };
    let mut sql = format!(
        "SELECT message_id, conversation_id, ordinal, role, author_id, content_text, payload, created_at_ms
         FROM lcm_messages WHERE conversation_id = ?1"
    );
    if let Some(ids) = message_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = ids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        sql.push_str(&format!(" AND message_id IN ({placeholders})"));
    }
    sql.push_str(&format!(" ORDER BY ordinal {order}"));
    if let Some(limit) = limit {
        sql.push_str(&format!(" LIMIT {limit}"));
    }

    let mut stmt = conn.prepare(&sql)?;
    let rows = if let Some(ids) = message_ids {
        let mut params_vec: Vec<&dyn rusqlite::ToSql> = vec![&conversation_id];
        for id in ids {
            params_vec.push(id);
        }
        stmt.query_map(params_vec.as_slice(), row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![conversation_id], row_to_message)?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };
    Ok(rows)
}
