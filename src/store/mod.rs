// store/mod.rs
// Typed API over the Storage Backend for the canonical conversation model
// (messages, parts, context items, lineage, search).

mod context_items;
mod conversation;
mod lineage;
mod messages;
mod search;

pub use context_items::{NewContextItem, ReplaceRangeParams};
pub use search::{SearchMatch, SearchMode};

use std::sync::Arc;

use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::StorageBackend;
use crate::error::{LcmError, Result};
use crate::model::{
    Conversation, ContextItem, ContextItemKind, LineageRelation, Message, MessagePart, Role,
};

/// Input to [`ConversationStore::create_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub message_id: String,
    pub conversation_id: String,
    pub ordinal: i64,
    pub role: Role,
    pub author_id: Option<String>,
    pub content_text: String,
    pub payload: serde_json::Value,
    pub created_at_ms: i64,
}

/// Input to [`ConversationStore::ingest_message`]: assigns the next ordinal
/// for `conversation_id` itself, inside the same transaction as the insert,
/// so concurrent ingests on one conversation never race on ordinal
/// assignment (spec §5: "resulting ordinal values are strictly increasing").
#[derive(Debug, Clone)]
pub struct IngestMessageInput {
    pub message_id: String,
    pub conversation_id: String,
    pub role: Role,
    pub author_id: Option<String>,
    pub content_text: String,
    pub payload: serde_json::Value,
    pub parts: Vec<NewMessagePart>,
    pub created_at_ms: i64,
}

/// Input to [`ConversationStore::create_message_parts`].
#[derive(Debug, Clone)]
pub struct NewMessagePart {
    pub part_id: String,
    pub part_index: i64,
    pub kind: crate::model::PartKind,
    pub mime_type: Option<String>,
    pub text_content: Option<String>,
    pub blob_path: Option<String>,
    pub token_count: Option<i64>,
    pub payload: serde_json::Value,
    pub created_at_ms: i64,
}

/// Computes the deterministic id of the canonical pointer context item for a
/// `(conversationId, messageId)` pair — the `ctxmsg_*` item through which
/// summary lineage links transitively to a raw message, per spec §4.3.
pub fn ctx_msg_pointer_id(conversation_id: &str, message_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(conversation_id.as_bytes());
    hasher.update(b"|");
    hasher.update(message_id.as_bytes());
    format!("ctxmsg_{:x}", hasher.finalize())
}

/// Thin typed facade over [`StorageBackend`] implementing the Conversation
/// Store contract. Mirrors the teacher's `Database` wrapping `DatabasePool`:
/// every public method is an async wrapper around a `pub(crate)` sync
/// function taking `&Connection`.
pub struct ConversationStore {
    backend: Arc<StorageBackend>,
}

impl ConversationStore {
    pub fn new(backend: Arc<StorageBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<StorageBackend> {
        &self.backend
    }

    pub async fn ensure_conversation(
        &self,
        conversation_id: &str,
        session_id: &str,
        channel: Option<String>,
        now_ms: i64,
    ) -> Result<Conversation> {
        let conversation_id = conversation_id.to_string();
        let session_id = session_id.to_string();
        self.backend
            .run(move |conn| {
                conversation::ensure_conversation_sync(
                    conn,
                    &conversation_id,
                    &session_id,
                    channel.as_deref(),
                    now_ms,
                )
            })
            .await
    }

    pub async fn touch_conversation(&self, conversation_id: &str, now_ms: i64) -> Result<()> {
        let conversation_id = conversation_id.to_string();
        self.backend
            .run(move |conn| conversation::touch_conversation_sync(conn, &conversation_id, now_ms))
            .await
    }

    pub async fn create_message(&self, input: NewMessage) -> Result<Message> {
        self.backend
            .run(move |conn| messages::create_message_sync(conn, &input))
            .await
    }

    /// Ingests one turn atomically: assigns the next ordinal, inserts the
    /// message and its parts, and appends the `ctxmsg_*` context-item
    /// pointer, all in one transaction. Idempotent on `message_id` (spec
    /// §8: re-ingesting the same id yields one row).
    pub async fn ingest_message(&self, input: IngestMessageInput) -> Result<(Message, ContextItem)> {
        self.backend
            .with_transaction(crate::db::TxMode::Immediate, 3, move |conn| {
                let ordinal = messages::next_ordinal_sync(conn, &input.conversation_id)?;
                let message = messages::create_message_sync(
                    conn,
                    &NewMessage {
                        message_id: input.message_id.clone(),
                        conversation_id: input.conversation_id.clone(),
                        ordinal,
                        role: input.role,
                        author_id: input.author_id.clone(),
                        content_text: input.content_text.clone(),
                        payload: input.payload.clone(),
                        created_at_ms: input.created_at_ms,
                    },
                )?;
                if !input.parts.is_empty() {
                    messages::create_message_parts_sync(conn, &message.message_id, input.parts.clone())?;
                }
                let ctx_item = context_items::append_context_message_sync(
                    conn,
                    &input.conversation_id,
                    &message.message_id,
                    input.created_at_ms,
                )?;
                Ok((message, ctx_item))
            })
            .await
    }

    pub async fn create_message_parts(
        &self,
        message_id: &str,
        parts: Vec<NewMessagePart>,
    ) -> Result<Vec<MessagePart>> {
        let message_id = message_id.to_string();
        self.backend
            .run(move |conn| messages::create_message_parts_sync(conn, &message_id, parts))
            .await
    }

    pub async fn list_messages(
        &self,
        conversation_id: &str,
        message_ids: Option<Vec<String>>,
        limit: Option<usize>,
        descending: bool,
    ) -> Result<Vec<Message>> {
        let conversation_id = conversation_id.to_string();
        self.backend
            .run(move |conn| {
                messages::list_messages_sync(
                    conn,
                    &conversation_id,
                    message_ids.as_deref(),
                    limit,
                    descending,
                )
            })
            .await
    }

    pub async fn list_message_parts(&self, message_id: &str) -> Result<Vec<MessagePart>> {
        let message_id = message_id.to_string();
        self.backend
            .run(move |conn| messages::list_message_parts_sync(conn, &message_id))
            .await
    }

    pub async fn append_context_message(
        &self,
        conversation_id: &str,
        message_id: &str,
        now_ms: i64,
    ) -> Result<ContextItem> {
        let conversation_id = conversation_id.to_string();
        let message_id = message_id.to_string();
        self.backend
            .run(move |conn| {
                context_items::append_context_message_sync(conn, &conversation_id, &message_id, now_ms)
            })
            .await
    }

    pub async fn insert_summary(&self, item: NewContextItem) -> Result<ContextItem> {
        self.backend
            .run(move |conn| context_items::insert_summary_sync(conn, &item))
            .await
    }

    pub async fn link_summary_to_messages(
        &self,
        summary_id: &str,
        message_ids: Vec<String>,
        conversation_id: &str,
        now_ms: i64,
    ) -> Result<()> {
        let summary_id = summary_id.to_string();
        let conversation_id = conversation_id.to_string();
        self.backend
            .run(move |conn| {
                context_items::link_summary_to_messages_sync(
                    conn,
                    &summary_id,
                    &conversation_id,
                    &message_ids,
                    now_ms,
                )
            })
            .await
    }

    pub async fn link_summary_to_parents(
        &self,
        summary_id: &str,
        parent_summary_ids: Vec<String>,
        now_ms: i64,
    ) -> Result<()> {
        let summary_id = summary_id.to_string();
        self.backend
            .run(move |conn| {
                lineage::link_summary_to_parents_sync(conn, &summary_id, &parent_summary_ids, now_ms)
            })
            .await
    }

    pub async fn replace_context_range_with_summary(
        &self,
        params: ReplaceRangeParams,
    ) -> Result<usize> {
        self.backend
            .run(move |conn| context_items::replace_context_range_with_summary_sync(conn, &params))
            .await
    }

    /// Commits one compaction step atomically (spec §4.4/§5): inserting the
    /// summary row, linking it to its direct message sources and/or parent
    /// summaries, and tombstoning the replaced range, all within a single
    /// transaction so a crash or concurrent reader never observes a
    /// half-compacted graph.
    pub async fn commit_compaction(
        &self,
        item: NewContextItem,
        message_ids: Vec<String>,
        parent_summary_ids: Vec<String>,
        range: ReplaceRangeParams,
    ) -> Result<(ContextItem, usize)> {
        self.backend
            .with_transaction(crate::db::TxMode::Immediate, 3, move |conn| {
                let summary = context_items::insert_summary_sync(conn, &item)?;
                if !message_ids.is_empty() {
                    context_items::link_summary_to_messages_sync(
                        conn,
                        &summary.item_id,
                        &item.conversation_id,
                        &message_ids,
                        item.updated_at_ms,
                    )?;
                }
                if !parent_summary_ids.is_empty() {
                    lineage::link_summary_to_parents_sync(
                        conn,
                        &summary.item_id,
                        &parent_summary_ids,
                        item.updated_at_ms,
                    )?;
                }
                let tombstoned = context_items::replace_context_range_with_summary_sync(conn, &range)?;
                Ok((summary.clone(), tombstoned))
            })
            .await
    }

    pub async fn get_context_items(
        &self,
        conversation_id: &str,
        include_tombstoned: bool,
        item_types: Option<Vec<ContextItemKind>>,
        limit: Option<usize>,
    ) -> Result<Vec<ContextItem>> {
        let conversation_id = conversation_id.to_string();
        self.backend
            .run(move |conn| {
                context_items::get_context_items_sync(
                    conn,
                    &conversation_id,
                    include_tombstoned,
                    item_types.as_deref(),
                    limit,
                )
            })
            .await
    }

    pub async fn get_context_item(&self, item_id: &str) -> Result<Option<ContextItem>> {
        let item_id = item_id.to_string();
        self.backend
            .run(move |conn| context_items::get_context_item_sync(conn, &item_id))
            .await
    }

    pub async fn get_summary_messages(&self, summary_id: &str, limit: usize) -> Result<Vec<Message>> {
        let summary_id = summary_id.to_string();
        self.backend
            .run(move |conn| lineage::get_summary_messages_sync(conn, &summary_id, limit))
            .await
    }

    pub async fn get_lineage_parents(&self, item_id: &str) -> Result<Vec<crate::model::LineageEdge>> {
        let item_id = item_id.to_string();
        self.backend
            .run(move |conn| lineage::get_parents_sync(conn, &item_id))
            .await
    }

    pub async fn get_lineage_children(&self, item_id: &str) -> Result<Vec<crate::model::LineageEdge>> {
        let item_id = item_id.to_string();
        self.backend
            .run(move |conn| lineage::get_children_sync(conn, &item_id))
            .await
    }

    pub async fn search_messages(
        &self,
        conversation_id: Option<String>,
        query: &str,
        mode: SearchMode,
        fts_available: bool,
        limit: usize,
    ) -> Result<Vec<SearchMatch>> {
        if query.trim().is_empty() {
            return Err(LcmError::InvalidInput("search query must not be empty".into()));
        }
        let query = query.to_string();
        self.backend
            .run(move |conn| {
                search::search_messages_sync(conn, conversation_id.as_deref(), &query, mode, fts_available, limit)
            })
            .await
    }

    pub async fn search_summaries(
        &self,
        conversation_id: Option<String>,
        query: &str,
        mode: SearchMode,
        fts_available: bool,
        limit: usize,
    ) -> Result<Vec<SearchMatch>> {
        if query.trim().is_empty() {
            return Err(LcmError::InvalidInput("search query must not be empty".into()));
        }
        let query = query.to_string();
        self.backend
            .run(move |conn| {
                search::search_summaries_sync(conn, conversation_id.as_deref(), &query, mode, fts_available, limit)
            })
            .await
    }
}

pub fn new_uuid() -> String {
    Uuid::new_v4().to_string()
}
