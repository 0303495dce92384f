// assembler.rs
// Context Assembler (spec §4.7): builds the ordered, budgeted message array
// the model sees on the next turn. Read-only — never writes to storage.
//
// Mirrors the teacher's `BudgetManager`/`truncate_messages_to_budget` idiom
// (`context/budget.rs`, `llm/context_budget.rs`) generalized from a flat
// character cap over concatenated strings to a structured message list that
// protects a fresh tail of recent turns instead of blindly dropping the
// oldest entries.

use std::sync::Arc;

use crate::estimator::TokenEstimator;
use crate::model::{AssembledMessage, ContentBlock, ContextItem, ContextItemKind, MessageContent, Role};
use crate::store::ConversationStore;
use crate::error::Result;

/// Output of [`Assembler::assemble`].
#[derive(Debug, Clone)]
pub struct AssembledContext {
    pub messages: Vec<AssembledMessage>,
    pub estimated_tokens: usize,
}

pub struct Assembler {
    store: Arc<ConversationStore>,
    estimator: Arc<dyn TokenEstimator>,
}

impl Assembler {
    pub fn new(store: Arc<ConversationStore>, estimator: Arc<dyn TokenEstimator>) -> Self {
        Self { store, estimator }
    }

    /// Builds the model-facing message array for `conversation_id`.
    ///
    /// `token_budget` of `None` returns every active item (the fresh tail is
    /// always a subset of "every active item" in that case, so no truncation
    /// logic runs).
    pub async fn assemble(
        &self,
        conversation_id: &str,
        token_budget: Option<usize>,
        fresh_tail_count: usize,
    ) -> Result<AssembledContext> {
        let items = self
            .store
            .get_context_items(conversation_id, false, None, None)
            .await?;

        let mut resolved = Vec::with_capacity(items.len());
        for item in &items {
            resolved.push(self.resolve_item(item).await?);
        }

        let assembled = match token_budget {
            None => resolved,
            Some(budget) => self.apply_budget(resolved, budget, fresh_tail_count),
        };

        let sanitized = sanitize_tool_pairing(assembled);
        let estimated_tokens = sanitized
            .iter()
            .map(|m| self.estimator.estimate_text(&m.content.as_text()))
            .sum();

        Ok(AssembledContext {
            messages: sanitized,
            estimated_tokens,
        })
    }

    /// Step 4-5 of the algorithm: protect the last `fresh_tail_count`
    /// resolved items, then fill the remaining budget from the evictable
    /// prefix newest-first, keeping cumulative-fit items before restoring
    /// chronological order.
    fn apply_budget(
        &self,
        mut resolved: Vec<AssembledMessage>,
        token_budget: usize,
        fresh_tail_count: usize,
    ) -> Vec<AssembledMessage> {
        let tail_start = resolved.len().saturating_sub(fresh_tail_count);
        let tail: Vec<AssembledMessage> = resolved.split_off(tail_start);
        let prefix = resolved;

        let tail_tokens: usize = tail
            .iter()
            .map(|m| self.estimator.estimate_text(&m.content.as_text()))
            .sum();
        let remaining_budget = token_budget.saturating_sub(tail_tokens);

        let mut kept_prefix = Vec::new();
        let mut used = 0usize;
        for msg in prefix.into_iter().rev() {
            let tokens = self.estimator.estimate_text(&msg.content.as_text());
            if used + tokens > remaining_budget {
                // Stop at the first item (newest-to-oldest) that doesn't fit,
                // so the retained prefix stays a contiguous suffix of itself
                // (spec §4.7 step 4: "equivalent to dropping the oldest
                // items until the prefix fits") instead of admitting a
                // smaller, older item past a skipped larger one.
                break;
            }
            used += tokens;
            kept_prefix.push(msg);
        }
        kept_prefix.reverse();

        kept_prefix.into_iter().chain(tail).collect()
    }

    async fn resolve_item(&self, item: &ContextItem) -> Result<AssembledMessage> {
        match item.item_type {
            ContextItemKind::Message => self.resolve_message_item(item).await,
            ContextItemKind::Summary => self.resolve_summary_item(item).await,
            ContextItemKind::Note | ContextItemKind::Artifact => Ok(AssembledMessage {
                role: Role::User,
                content: MessageContent::Text(item.body.clone()),
                source_item_id: item.item_id.clone(),
                tool_call_ids: Vec::new(),
                tool_result_for: None,
            }),
        }
    }

    async fn resolve_message_item(&self, item: &ContextItem) -> Result<AssembledMessage> {
        let Some(message_id) = item.source_message_id.clone() else {
            return Err(crate::error::LcmError::Integrity(format!(
                "message-type context item {} has no source_message_id",
                item.item_id
            )));
        };

        let messages = self
            .store
            .list_messages(&item.conversation_id, Some(vec![message_id.clone()]), Some(1), false)
            .await?;
        let Some(message) = messages.into_iter().next() else {
            return Err(crate::error::LcmError::Integrity(format!(
                "message {message_id} referenced by context item {} does not exist",
                item.item_id
            )));
        };

        let parts = self.store.list_message_parts(&message_id).await?;

        let mut role = message.role;
        let mut blocks = Vec::new();
        let mut tool_call_ids = Vec::new();
        let mut tool_result_for = None;
        let mut has_structured = false;

        if parts.is_empty() {
            blocks.push(ContentBlock::Text {
                text: message.content_text.clone(),
            });
        }

        for part in &parts {
            if let Some(original_role) = part
                .payload
                .get("original_role")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Role>().ok())
            {
                role = original_role;
            }

            match part.kind {
                crate::model::PartKind::Tool => {
                    has_structured = true;
                    if let Some(call) = part.payload.get("tool_call") {
                        let id = call.get("id").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                        let name = call.get("name").and_then(|v| v.as_str()).unwrap_or_default().to_string();
                        let input = call.get("input").cloned().unwrap_or(serde_json::Value::Null);
                        tool_call_ids.push(id.clone());
                        blocks.push(ContentBlock::ToolUse { id, name, input });
                    } else if let Some(result) = part.payload.get("tool_result") {
                        let tool_use_id = result
                            .get("tool_use_id")
                            .and_then(|v| v.as_str())
                            .unwrap_or_default()
                            .to_string();
                        let content = part.text_content.clone().unwrap_or_default();
                        tool_result_for = Some(tool_use_id.clone());
                        blocks.push(ContentBlock::ToolResult { tool_use_id, content });
                    } else if let Some(text) = &part.text_content {
                        blocks.push(ContentBlock::Text { text: text.clone() });
                    }
                }
                _ => {
                    let text = part.text_content.clone().unwrap_or_default();
                    blocks.push(ContentBlock::Text { text });
                }
            }
        }

        let content = if has_structured {
            MessageContent::Blocks(blocks)
        } else {
            let joined = blocks
                .into_iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text,
                    _ => String::new(),
                })
                .collect::<Vec<_>>()
                .join("\n");
            MessageContent::Text(if joined.is_empty() { message.content_text } else { joined })
        };

        Ok(AssembledMessage {
            role,
            content,
            source_item_id: item.item_id.clone(),
            tool_call_ids,
            tool_result_for,
        })
    }

    async fn resolve_summary_item(&self, item: &ContextItem) -> Result<AssembledMessage> {
        let parents = self.store.get_lineage_parents(&item.item_id).await?;
        let parent_ids: Vec<&str> = parents
            .iter()
            .filter(|e| e.relation == crate::model::LineageRelation::Derived)
            .map(|e| e.parent_item_id.as_str())
            .collect();

        let header = if parent_ids.is_empty() {
            format!("[Summary ID: {}]\n\n{}", item.item_id, item.body)
        } else {
            format!(
                "[Summary ID: {}]\n[Parent Summaries: {}]\n\n{}",
                item.item_id,
                parent_ids.join(", "),
                item.body
            )
        };

        Ok(AssembledMessage {
            role: Role::User,
            content: MessageContent::Text(header),
            source_item_id: item.item_id.clone(),
            tool_call_ids: Vec::new(),
            tool_result_for: None,
        })
    }
}

/// Step 6 of the algorithm: drop any `tool_result` whose preceding
/// `tool_call` is not present in the assembled window, and symmetrically
/// drop any orphaned `tool_call` left dangling at the trailing edge.
fn sanitize_tool_pairing(messages: Vec<AssembledMessage>) -> Vec<AssembledMessage> {
    use std::collections::HashSet;

    let mut seen_calls: HashSet<String> = HashSet::new();
    let mut pass1 = Vec::with_capacity(messages.len());
    for msg in messages {
        if let Some(tool_use_id) = &msg.tool_result_for {
            if !seen_calls.contains(tool_use_id) {
                continue; // orphan tool_result: its tool_call isn't in the window
            }
        }
        for id in &msg.tool_call_ids {
            seen_calls.insert(id.clone());
        }
        pass1.push(msg);
    }

    let mut answered: HashSet<String> = HashSet::new();
    for msg in &pass1 {
        if let Some(id) = &msg.tool_result_for {
            answered.insert(id.clone());
        }
    }

    pass1
        .into_iter()
        .filter_map(|mut msg| {
            msg.tool_call_ids.retain(|id| answered.contains(id));
            if msg.tool_call_ids.is_empty() && matches!(msg.content, MessageContent::Blocks(ref b) if b.iter().all(|blk| matches!(blk, ContentBlock::ToolUse { .. })))
            {
                return None; // trailing orphan tool_call with nothing else to say
            }
            Some(msg)
        })
        .collect()
}
