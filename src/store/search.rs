// store/search.rs
// Substring and FTS-backed search over messages and summary context items
// (spec §4.3 `searchMessages`/`searchSummaries`). Dual-path ranking: FTS5
// when the backend reports it available, case-insensitive substring with
// deterministic ordering otherwise.

use rusqlite::{params, Connection};

use crate::error::Result;

/// Search mode selector, mirrored from the Storage Backend's `ftsAvailable`
/// flag rather than chosen per-call by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    FullText,
    Substring,
}

/// One search hit: the owning row id, a bounded snippet, and an optional FTS
/// rank (lower is better; `None` when substring fallback was used).
#[derive(Debug, Clone, PartialEq)]
pub struct SearchMatch {
    pub id: String,
    pub conversation_id: String,
    pub snippet: String,
    pub score: Option<f64>,
    pub created_at_ms: i64,
}

const SNIPPET_RADIUS: usize = 80;

fn snippet_around(text: &str, query: &str) -> String {
    let lower_text = text.to_lowercase();
    let lower_query = query.to_lowercase();
    let Some(byte_pos) = lower_text.find(&lower_query) else {
        let end = text.len().min(SNIPPET_RADIUS * 2);
        return text[..end].to_string();
    };

    // Clamp to char boundaries so we never slice mid-codepoint.
    let mut start = byte_pos.saturating_sub(SNIPPET_RADIUS);
    while start > 0 && !text.is_char_boundary(start) {
        start -= 1;
    }
    let mut end = (byte_pos + lower_query.len() + SNIPPET_RADIUS).min(text.len());
    while end < text.len() && !text.is_char_boundary(end) {
        end += 1;
    }

    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str("…");
    }
    snippet.push_str(&text[start..end]);
    if end < text.len() {
        snippet.push_str("…");
    }
    snippet
}

/// Substring search over `lcm_messages.content_text`, case-insensitive,
/// ordered deterministically by `(createdAtMs ASC, id ASC)`.
fn substring_search_messages(
    conn: &Connection,
    conversation_id: Option<&str>,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchMatch>> {
    let mut sql = String::from(
        "SELECT message_id, conversation_id, content_text, created_at_ms FROM lcm_messages WHERE 1=1",
    );
    if conversation_id.is_some() {
        sql.push_str(" AND conversation_id = ?1");
    }
    sql.push_str(" ORDER BY created_at_ms ASC, message_id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let needle = query.to_lowercase();

    let rows: Vec<(String, String, String, i64)> = if let Some(cid) = conversation_id {
        stmt.query_map(params![cid], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut matches = Vec::new();
    for (id, cid, content, created_at_ms) in rows {
        if content.to_lowercase().contains(&needle) {
            matches.push(SearchMatch {
                id,
                conversation_id: cid,
                snippet: snippet_around(&content, query),
                score: None,
                created_at_ms,
            });
            if matches.len() >= limit {
                break;
            }
        }
    }
    Ok(matches)
}

fn substring_search_summaries(
    conn: &Connection,
    conversation_id: Option<&str>,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchMatch>> {
    let mut sql = String::from(
        "SELECT item_id, conversation_id, COALESCE(title, '') || ' ' || body, created_at_ms
         FROM lcm_context_items WHERE item_type = 'summary'",
    );
    if conversation_id.is_some() {
        sql.push_str(" AND conversation_id = ?1");
    }
    sql.push_str(" ORDER BY created_at_ms ASC, item_id ASC");

    let mut stmt = conn.prepare(&sql)?;
    let needle = query.to_lowercase();

    let rows: Vec<(String, String, String, i64)> = if let Some(cid) = conversation_id {
        stmt.query_map(params![cid], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    let mut matches = Vec::new();
    for (id, cid, body, created_at_ms) in rows {
        if body.to_lowercase().contains(&needle) {
            matches.push(SearchMatch {
                id,
                conversation_id: cid,
                snippet: snippet_around(&body, query),
                score: None,
                created_at_ms,
            });
            if matches.len() >= limit {
                break;
            }
        }
    }
    Ok(matches)
}

/// FTS5 query over `lcm_context_items_fts`'s `title||body` index (spec
/// §4.1), ranked ascending by `bm25()` (lower is better in SQLite's FTS5
/// ranking convention). `f MATCH ?1` (no column qualifier) searches every
/// indexed column of the virtual table, i.e. both `title` and `body`.
fn fts_search_summaries(
    conn: &Connection,
    conversation_id: Option<&str>,
    query: &str,
    limit: usize,
) -> Result<Vec<SearchMatch>> {
    let mut sql = String::from(
        "SELECT ci.item_id, ci.conversation_id, ci.title, ci.body, ci.created_at_ms, bm25(f) AS rank
         FROM lcm_context_items_fts f
         JOIN lcm_context_items ci ON ci.item_id = f.item_id
         WHERE f MATCH ?1 AND ci.item_type = 'summary'",
    );
    if conversation_id.is_some() {
        sql.push_str(" AND ci.conversation_id = ?2");
    }
    sql.push_str(" ORDER BY rank ASC, ci.created_at_ms ASC, ci.item_id ASC LIMIT ?3");

    let escaped = fts_escape(query);
    let mut stmt = conn.prepare(&sql)?;
    let limit_i64 = limit as i64;

    let rows: Vec<(String, String, Option<String>, String, i64, f64)> = if let Some(cid) = conversation_id {
        stmt.query_map(params![escaped, cid, limit_i64], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map(params![escaped, limit_i64], |r| {
            Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?, r.get(5)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?
    };

    Ok(rows
        .into_iter()
        .map(|(id, cid, title, body, created_at_ms, rank)| {
            let haystack = match &title {
                Some(t) if !t.is_empty() => format!("{t} {body}"),
                _ => body,
            };
            SearchMatch {
                id,
                conversation_id: cid,
                snippet: snippet_around(&haystack, query),
                score: Some(rank),
                created_at_ms,
            }
        })
        .collect())
}

/// FTS5 `MATCH` treats many punctuation characters specially; wrap the query
/// in double quotes so ordinary free-text search terms are treated literally.
fn fts_escape(query: &str) -> String {
    format!("\"{}\"", query.replace('"', "\"\""))
}

pub fn search_messages_sync(
    conn: &Connection,
    conversation_id: Option<&str>,
    query: &str,
    mode: SearchMode,
    fts_available: bool,
    limit: usize,
) -> Result<Vec<SearchMatch>> {
    let _ = (mode, fts_available);
    // Messages have no FTS shadow table in the spec's persistence layout
    // (only context-item title||body is indexed) — always substring.
    substring_search_messages(conn, conversation_id, query, limit)
}

pub fn search_summaries_sync(
    conn: &Connection,
    conversation_id: Option<&str>,
    query: &str,
    mode: SearchMode,
    fts_available: bool,
    limit: usize,
) -> Result<Vec<SearchMatch>> {
    if matches!(mode, SearchMode::FullText) && fts_available {
        return fts_search_summaries(conn, conversation_id, query, limit);
    }
    substring_search_summaries(conn, conversation_id, query, limit)
}
