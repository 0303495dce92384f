// model.rs
// Entity types for the LCM data model (spec §3).

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use strum::{Display, EnumString};

/// `{ conversationId, sessionId, channel?, createdAtMs, updatedAtMs }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    pub conversation_id: String,
    pub session_id: String,
    pub channel: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

/// Canonical, append-only message role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// `{ messageId, conversationId, ordinal, role, authorId?, contentText, payload, createdAtMs }`
///
/// Invariants I1–I3: ordinals are contiguous from 0 per conversation,
/// `(conversationId, ordinal)` is unique, and rows are never updated or
/// deleted once written.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub message_id: String,
    pub conversation_id: String,
    pub ordinal: i64,
    pub role: Role,
    pub author_id: Option<String>,
    pub content_text: String,
    pub payload: Json,
    pub created_at_ms: i64,
}

/// Kind tag for a [`MessagePart`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PartKind {
    Text,
    Tool,
    Reasoning,
    Image,
    Other(String),
}

impl PartKind {
    /// Parse a stored kind column back into a `PartKind`, routing any
    /// unrecognized string through the `Other` extension slot instead of
    /// failing — new part kinds introduced by a host must not break reads.
    pub fn from_stored(s: &str) -> Self {
        match s {
            "text" => PartKind::Text,
            "tool" => PartKind::Tool,
            "reasoning" => PartKind::Reasoning,
            "image" => PartKind::Image,
            other => PartKind::Other(other.to_string()),
        }
    }

    pub fn as_stored(&self) -> String {
        match self {
            PartKind::Other(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// `{ partId, messageId, partIndex, kind, mimeType?, textContent?, blobPath?, tokenCount?, payload, createdAtMs }`
///
/// Invariants I4/I5: every part points to an existing message, and
/// `(messageId, partIndex)` is unique.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePart {
    pub part_id: String,
    pub message_id: String,
    pub part_index: i64,
    pub kind: PartKind,
    pub mime_type: Option<String>,
    pub text_content: Option<String>,
    pub blob_path: Option<String>,
    pub token_count: Option<i64>,
    pub payload: Json,
    pub created_at_ms: i64,
}

/// Context item subclass tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ContextItemKind {
    Message,
    Summary,
    Note,
    Artifact,
}

/// `{ itemId, conversationId, sourceMessageId?, itemType, depth, title?, body, metadata, tombstoned, createdAtMs, updatedAtMs }`
///
/// Invariants I6–I8: a `message`-type item references an existing canonical
/// message; once tombstoned an item never returns to active; active items
/// order by `(createdAtMs, itemId)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextItem {
    pub item_id: String,
    pub conversation_id: String,
    pub source_message_id: Option<String>,
    pub item_type: ContextItemKind,
    pub depth: i64,
    pub title: Option<String>,
    pub body: String,
    pub metadata: Json,
    pub tombstoned: bool,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

impl ContextItem {
    pub fn is_summary(&self) -> bool {
        self.item_type == ContextItemKind::Summary
    }
}

/// Lineage edge relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LineageRelation {
    Summarizes,
    Derived,
    Compacted,
}

/// `{ parentItemId, childItemId, relation, metadata, createdAtMs }`
///
/// Invariants I9/I10: both endpoints resolve to existing context items, and
/// edges are never deleted by normal operation (append-first). Per DESIGN
/// NOTES, `createdAtMs(parent) < createdAtMs(child)` to keep the DAG acyclic
/// under append-first traversal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineageEdge {
    pub parent_item_id: String,
    pub child_item_id: String,
    pub relation: LineageRelation,
    pub metadata: Json,
    pub created_at_ms: i64,
}

/// `{ artifactId, conversationId, messageId?, path, mimeType?, bytes?, sha256?, metadata, createdAtMs }`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Artifact {
    pub artifact_id: String,
    pub conversation_id: String,
    pub message_id: Option<String>,
    pub path: String,
    pub mime_type: Option<String>,
    pub bytes: Option<i64>,
    pub sha256: Option<String>,
    pub metadata: Json,
    pub created_at_ms: i64,
}

/// `{ grantId, delegatorSessionKey, delegateSessionKey, allowedConversationIds, allowedSummaryIds, maxDepth, maxTokenCap, issuedAtMs, expiresAtMs, revoked }`
///
/// Invariant I12: usable only while `now < expiresAtMs && !revoked`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExpansionGrant {
    pub grant_id: String,
    pub delegator_session_key: String,
    pub delegate_session_key: String,
    pub allowed_conversation_ids: std::collections::HashSet<String>,
    /// Empty set means "any summary within the allowed conversations".
    pub allowed_summary_ids: std::collections::HashSet<String>,
    pub max_depth: u32,
    pub max_token_cap: usize,
    pub issued_at_ms: i64,
    pub expires_at_ms: i64,
    pub revoked: bool,
}

impl ExpansionGrant {
    pub fn is_usable(&self, now_ms: i64) -> bool {
        !self.revoked && now_ms < self.expires_at_ms
    }
}

/// One block of a normalized, provider-agnostic assistant content array
/// (spec §4.7 step 5: "normalize assistant string content into content-block
/// arrays for providers that require them").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    ToolUse { id: String, name: String, input: Json },
    ToolResult { tool_use_id: String, content: String },
}

/// An assembled message's content: plain text for simple messages, or a
/// content-block array once normalized for tool-use-bearing turns.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl MessageContent {
    pub fn as_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.clone(),
                    ContentBlock::ToolUse { name, input, .. } => {
                        format!("[tool_use {name}: {input}]")
                    }
                    ContentBlock::ToolResult { content, .. } => content.clone(),
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// A model-facing message produced by the Context Assembler (spec §4.7).
/// `source_item_id` traces the originating context item for diagnostics and
/// for the tool-call/tool-result pairing sanitizer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AssembledMessage {
    pub role: Role,
    pub content: MessageContent,
    pub source_item_id: String,
    #[serde(default)]
    pub tool_call_ids: Vec<String>,
    #[serde(default)]
    pub tool_result_for: Option<String>,
}
