// retrieval/describe.rs
// describe(id) (spec §4.5): resolves an id to either a summary describe or a
// file (artifact) describe, scanning the full history including tombstoned
// items — describe must still work after compaction replaces an item.

use std::sync::Arc;

use rusqlite::{params, OptionalExtension};

use crate::error::Result;
use crate::estimator::TokenEstimator;
use crate::model::LineageEdge;
use crate::store::ConversationStore;

#[derive(Debug, Clone)]
pub struct SummaryDescribe {
    pub item_id: String,
    pub conversation_id: String,
    pub title: Option<String>,
    pub body: String,
    pub depth: i64,
    pub tombstoned: bool,
    pub parents: Vec<LineageEdge>,
    pub children: Vec<LineageEdge>,
    pub source_message_ordinals: (Option<i64>, Option<i64>),
    pub estimated_tokens: usize,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

#[derive(Debug, Clone)]
pub struct FileDescribe {
    pub artifact_id: String,
    pub conversation_id: String,
    pub path: String,
    pub mime_type: Option<String>,
    pub bytes: Option<i64>,
    pub sha256: Option<String>,
    pub related_message_id: Option<String>,
}

#[derive(Debug, Clone)]
pub enum Describe {
    Summary(SummaryDescribe),
    File(FileDescribe),
}

#[allow(clippy::type_complexity)]
struct SummaryRow {
    item_id: String,
    conversation_id: String,
    title: Option<String>,
    body: String,
    depth: i64,
    tombstoned: bool,
    created_at_ms: i64,
    updated_at_ms: i64,
}

/// Resolves `id` as a summary context item first, then as an artifact.
/// Returns `None` when neither table has a matching row.
pub async fn describe(
    store: &Arc<ConversationStore>,
    estimator: Arc<dyn TokenEstimator>,
    id: &str,
) -> Result<Option<Describe>> {
    let id_owned = id.to_string();
    let row = store
        .backend()
        .run(move |conn| -> Result<Option<SummaryRow>> {
            conn.query_row(
                "SELECT item_id, conversation_id, title, body, depth, tombstoned, created_at_ms, updated_at_ms
                 FROM lcm_context_items WHERE item_id = ? AND item_type = 'summary'",
                params![id_owned],
                |r| {
                    Ok(SummaryRow {
                        item_id: r.get(0)?,
                        conversation_id: r.get(1)?,
                        title: r.get(2)?,
                        body: r.get(3)?,
                        depth: r.get(4)?,
                        tombstoned: r.get::<_, i64>(5)? != 0,
                        created_at_ms: r.get(6)?,
                        updated_at_ms: r.get(7)?,
                    })
                },
            )
            .optional()
            .map_err(crate::error::LcmError::Db)
        })
        .await?;

    if let Some(row) = row {
        let parents = store.get_lineage_parents(&row.item_id).await?;
        let children = store.get_lineage_children(&row.item_id).await?;
        let source_messages = store.get_summary_messages(&row.item_id, usize::MAX).await?;
        let ordinal_range = (
            source_messages.iter().map(|m| m.ordinal).min(),
            source_messages.iter().map(|m| m.ordinal).max(),
        );
        let estimated_tokens = estimator.estimate_text(&row.body);

        return Ok(Some(Describe::Summary(SummaryDescribe {
            item_id: row.item_id,
            conversation_id: row.conversation_id,
            title: row.title,
            body: row.body,
            depth: row.depth,
            tombstoned: row.tombstoned,
            parents,
            children,
            source_message_ordinals: ordinal_range,
            estimated_tokens,
            created_at_ms: row.created_at_ms,
            updated_at_ms: row.updated_at_ms,
        })));
    }

    let id_owned = id.to_string();
    let file = store
        .backend()
        .run(move |conn| -> Result<Option<FileDescribe>> {
            conn.query_row(
                "SELECT artifact_id, conversation_id, path, mime_type, bytes, sha256, message_id
                 FROM lcm_artifacts WHERE artifact_id = ?",
                params![id_owned],
                |r| {
                    Ok(FileDescribe {
                        artifact_id: r.get(0)?,
                        conversation_id: r.get(1)?,
                        path: r.get(2)?,
                        mime_type: r.get(3)?,
                        bytes: r.get(4)?,
                        sha256: r.get(5)?,
                        related_message_id: r.get(6)?,
                    })
                },
            )
            .optional()
            .map_err(crate::error::LcmError::Db)
        })
        .await?;

    Ok(file.map(Describe::File))
}
