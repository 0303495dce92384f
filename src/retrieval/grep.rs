// retrieval/grep.rs
// grep (spec §4.5): full-text or regex search across messages and/or
// summaries, deduplicated and deterministically ordered.

use std::sync::Arc;

use regex::Regex;
use rusqlite::params;

use crate::error::{LcmError, Result};
use crate::store::{ConversationStore, SearchMatch, SearchMode as StoreSearchMode};

/// `grep`'s text-matching strategy. `FullText` prefers the FTS5 index (when
/// available) for summaries and case-insensitive substring for messages;
/// `Regex` scans a bounded row count and evaluates a compiled pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrepMode {
    FullText,
    Regex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrepScope {
    Messages,
    Summaries,
    Both,
}

#[derive(Debug, Clone)]
pub struct GrepParams {
    pub query: String,
    pub mode: GrepMode,
    pub scope: GrepScope,
    pub conversation_id: Option<String>,
    pub limit: usize,
}

pub const DEFAULT_REGEX_SCAN_LIMIT: usize = 2_000;

#[derive(Debug, Clone)]
pub struct GrepResult {
    pub matches: Vec<SearchMatch>,
    pub truncated: bool,
}

fn regex_scan_messages(
    conn: &rusqlite::Connection,
    conversation_id: Option<&str>,
    pattern: &Regex,
    scan_limit: usize,
) -> Result<(Vec<SearchMatch>, bool)> {
    let mut sql = String::from(
        "SELECT message_id, conversation_id, content_text, created_at_ms FROM lcm_messages WHERE 1=1",
    );
    if conversation_id.is_some() {
        sql.push_str(" AND conversation_id = ?1");
    }
    sql.push_str(" ORDER BY created_at_ms ASC, message_id ASC LIMIT ");
    sql.push_str(&(scan_limit + 1).to_string());

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(String, String, String, i64)> = if let Some(cid) = conversation_id {
        stmt.query_map(params![cid], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    let scan_truncated = rows.len() > scan_limit;
    let mut matches = Vec::new();
    for (id, cid, content, created_at_ms) in rows.into_iter().take(scan_limit) {
        if let Some(m) = pattern.find(&content) {
            matches.push(SearchMatch {
                id,
                conversation_id: cid,
                snippet: snippet_from_match(&content, m.start(), m.end()),
                score: None,
                created_at_ms,
            });
        }
    }
    Ok((matches, scan_truncated))
}

fn regex_scan_summaries(
    conn: &rusqlite::Connection,
    conversation_id: Option<&str>,
    pattern: &Regex,
    scan_limit: usize,
) -> Result<(Vec<SearchMatch>, bool)> {
    let mut sql = String::from(
        "SELECT item_id, conversation_id, body, created_at_ms FROM lcm_context_items
         WHERE item_type = 'summary'",
    );
    if conversation_id.is_some() {
        sql.push_str(" AND conversation_id = ?1");
    }
    sql.push_str(" ORDER BY created_at_ms ASC, item_id ASC LIMIT ");
    sql.push_str(&(scan_limit + 1).to_string());

    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(String, String, String, i64)> = if let Some(cid) = conversation_id {
        stmt.query_map(params![cid], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    } else {
        stmt.query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?
    };

    let scan_truncated = rows.len() > scan_limit;
    let mut matches = Vec::new();
    for (id, cid, body, created_at_ms) in rows.into_iter().take(scan_limit) {
        if let Some(m) = pattern.find(&body) {
            matches.push(SearchMatch {
                id,
                conversation_id: cid,
                snippet: snippet_from_match(&body, m.start(), m.end()),
                score: None,
                created_at_ms,
            });
        }
    }
    Ok((matches, scan_truncated))
}

const SNIPPET_RADIUS: usize = 80;

fn snippet_from_match(text: &str, start: usize, end: usize) -> String {
    let mut lo = start.saturating_sub(SNIPPET_RADIUS);
    while lo > 0 && !text.is_char_boundary(lo) {
        lo -= 1;
    }
    let mut hi = (end + SNIPPET_RADIUS).min(text.len());
    while hi < text.len() && !text.is_char_boundary(hi) {
        hi += 1;
    }
    let mut snippet = String::new();
    if lo > 0 {
        snippet.push('…');
    }
    snippet.push_str(&text[lo..hi]);
    if hi < text.len() {
        snippet.push('…');
    }
    snippet
}

/// Deduplicates by id (keeping the first occurrence, which carries the best
/// score since inputs are pre-sorted within each source) then sorts by
/// `(score ascending with None last, createdAt descending, id ascending)`
/// per spec §4.5.
fn dedup_and_sort(mut matches: Vec<SearchMatch>, limit: usize) -> Vec<SearchMatch> {
    let mut seen = std::collections::HashSet::new();
    matches.retain(|m| seen.insert(m.id.clone()));
    matches.sort_by(|a, b| {
        let score_cmp = match (a.score, b.score) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(std::cmp::Ordering::Equal),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        };
        score_cmp
            .then_with(|| b.created_at_ms.cmp(&a.created_at_ms))
            .then_with(|| a.id.cmp(&b.id))
    });
    matches.truncate(limit);
    matches
}

pub async fn grep(store: &Arc<ConversationStore>, params: GrepParams) -> Result<GrepResult> {
    if params.query.trim().is_empty() {
        return Err(LcmError::InvalidInput("grep query must not be empty".into()));
    }

    match params.mode {
        GrepMode::FullText => {
            let fts_available = store.backend().fts_available();
            let mut matches = Vec::new();
            if matches!(params.scope, GrepScope::Messages | GrepScope::Both) {
                matches.extend(
                    store
                        .search_messages(
                            params.conversation_id.clone(),
                            &params.query,
                            StoreSearchMode::FullText,
                            fts_available,
                            params.limit,
                        )
                        .await?,
                );
            }
            if matches!(params.scope, GrepScope::Summaries | GrepScope::Both) {
                matches.extend(
                    store
                        .search_summaries(
                            params.conversation_id.clone(),
                            &params.query,
                            StoreSearchMode::FullText,
                            fts_available,
                            params.limit,
                        )
                        .await?,
                );
            }
            let result_truncated = matches.len() > params.limit;
            Ok(GrepResult {
                matches: dedup_and_sort(matches, params.limit),
                truncated: result_truncated,
            })
        }
        GrepMode::Regex => {
            let pattern = Regex::new(&params.query)
                .map_err(|e| LcmError::InvalidInput(format!("invalid regex: {e}")))?;
            let conversation_id = params.conversation_id.clone();
            let scope = params.scope;
            let (matches, scan_truncated) = store
                .backend()
                .run(move |conn| -> Result<(Vec<SearchMatch>, bool)> {
                    let mut all = Vec::new();
                    let mut truncated = false;
                    if matches!(scope, GrepScope::Messages | GrepScope::Both) {
                        let (m, t) = regex_scan_messages(
                            conn,
                            conversation_id.as_deref(),
                            &pattern,
                            DEFAULT_REGEX_SCAN_LIMIT,
                        )?;
                        all.extend(m);
                        truncated |= t;
                    }
                    if matches!(scope, GrepScope::Summaries | GrepScope::Both) {
                        let (m, t) = regex_scan_summaries(
                            conn,
                            conversation_id.as_deref(),
                            &pattern,
                            DEFAULT_REGEX_SCAN_LIMIT,
                        )?;
                        all.extend(m);
                        truncated |= t;
                    }
                    Ok((all, truncated))
                })
                .await?;

            let result_truncated = scan_truncated || matches.len() > params.limit;
            Ok(GrepResult {
                matches: dedup_and_sort(matches, params.limit),
                truncated: result_truncated,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StorageBackend;
    use crate::model::Role;
    use crate::store::NewMessage;

    async fn setup() -> Arc<ConversationStore> {
        let backend = Arc::new(StorageBackend::open_in_memory().await.unwrap());
        let store = Arc::new(ConversationStore::new(backend));
        store.ensure_conversation("c1", "s1", None, 0).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_grep_rejects_empty_query() {
        let store = setup().await;
        let err = grep(
            &store,
            GrepParams {
                query: "   ".into(),
                mode: GrepMode::FullText,
                scope: GrepScope::Messages,
                conversation_id: Some("c1".into()),
                limit: 10,
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LcmError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_grep_full_text_finds_message() {
        let store = setup().await;
        store
            .create_message(NewMessage {
                message_id: "m0".into(),
                conversation_id: "c1".into(),
                ordinal: 0,
                role: Role::User,
                author_id: None,
                content_text: "the rollout completed early".into(),
                payload: serde_json::json!({}),
                created_at_ms: 0,
            })
            .await
            .unwrap();

        let result = grep(
            &store,
            GrepParams {
                query: "rollout".into(),
                mode: GrepMode::FullText,
                scope: GrepScope::Messages,
                conversation_id: Some("c1".into()),
                limit: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].id, "m0");
        assert!(!result.truncated);
    }

    #[tokio::test]
    async fn test_grep_regex_matches_pattern() {
        let store = setup().await;
        store
            .create_message(NewMessage {
                message_id: "m0".into(),
                conversation_id: "c1".into(),
                ordinal: 0,
                role: Role::User,
                author_id: None,
                content_text: "error code E-4042 occurred".into(),
                payload: serde_json::json!({}),
                created_at_ms: 0,
            })
            .await
            .unwrap();

        let result = grep(
            &store,
            GrepParams {
                query: r"E-\d{4}".into(),
                mode: GrepMode::Regex,
                scope: GrepScope::Messages,
                conversation_id: Some("c1".into()),
                limit: 10,
            },
        )
        .await
        .unwrap();
        assert_eq!(result.matches.len(), 1);
        assert!(result.matches[0].snippet.contains("E-4042"));
    }

    #[test]
    fn test_dedup_and_sort_orders_by_score_then_recency_then_id() {
        let matches = vec![
            SearchMatch { id: "b".into(), conversation_id: "c1".into(), snippet: "".into(), score: None, created_at_ms: 5 },
            SearchMatch { id: "a".into(), conversation_id: "c1".into(), snippet: "".into(), score: Some(1.0), created_at_ms: 1 },
            SearchMatch { id: "a".into(), conversation_id: "c1".into(), snippet: "dup".into(), score: Some(9.0), created_at_ms: 1 },
            SearchMatch { id: "c".into(), conversation_id: "c1".into(), snippet: "".into(), score: None, created_at_ms: 10 },
        ];
        let sorted = dedup_and_sort(matches, 10);
        let ids: Vec<&str> = sorted.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c", "b"]);
    }
}
