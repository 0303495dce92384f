// retrieval/expand.rs
// expand (spec §4.5): BFS from a summary down through its lineage sources
// (the parent endpoint of each incoming edge, since edges point older item
// -> newer summary per spec §3), resolving nested summaries and leaves (and
// optionally their underlying messages) up to a depth, item-count, and
// token-count bound. Uses an explicit worklist with a visited set rather
// than recursion, per spec §9's note on bounding stack use for lineage
// traversal.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use crate::config::LcmConfig;
use crate::error::Result;
use crate::estimator::TokenEstimator;
use crate::model::{ContextItem, ContextItemKind, Message};
use crate::store::ConversationStore;

/// Hard ceiling on `depth`, independent of any per-call configuration.
pub const MAX_EXPAND_DEPTH: u32 = 8;

const DEPTH_DEFAULT: u32 = 2;
const ITEM_LIMIT_MIN: usize = 1;
const ITEM_LIMIT_MAX: usize = 500;
const ITEM_LIMIT_DEFAULT: usize = 40;
const TOKEN_CAP_MIN: usize = 1;
const TOKEN_CAP_MAX: usize = 20_000;
const TOKEN_CAP_DEFAULT: usize = 4_000;

#[derive(Debug, Clone, Default)]
pub struct ExpandParams {
    pub summary_id: String,
    pub depth: Option<u32>,
    pub include_messages: bool,
    pub token_cap: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct ExpandResult {
    pub summaries: Vec<ContextItem>,
    pub messages: Vec<Message>,
    pub estimated_tokens: usize,
    pub truncated: bool,
    pub next_summary_ids: Vec<String>,
}

fn clamp_depth(requested: Option<u32>, config_cap: u32) -> u32 {
    requested.unwrap_or(DEPTH_DEFAULT).min(config_cap.min(MAX_EXPAND_DEPTH))
}

fn clamp_item_limit(requested: Option<usize>) -> usize {
    requested.unwrap_or(ITEM_LIMIT_DEFAULT).clamp(ITEM_LIMIT_MIN, ITEM_LIMIT_MAX)
}

fn clamp_token_cap(requested: Option<usize>, config_max: usize) -> usize {
    requested
        .unwrap_or(TOKEN_CAP_DEFAULT)
        .clamp(TOKEN_CAP_MIN, TOKEN_CAP_MAX.min(config_max.max(TOKEN_CAP_MIN)))
}

struct Frontier {
    item: ContextItem,
    depth: u32,
}

/// BFS through the lineage sources of `params.summary_id`, bounded by depth,
/// item count, and token budget. Items that would exceed the token cap are
/// deferred into `nextSummaryIds` rather than dropped, so callers can
/// continue the walk with a fresh call.
pub async fn expand(
    store: &Arc<ConversationStore>,
    estimator: &Arc<dyn TokenEstimator>,
    config: &LcmConfig,
    params: ExpandParams,
) -> Result<ExpandResult> {
    let max_depth = clamp_depth(params.depth, MAX_EXPAND_DEPTH);
    let item_limit = clamp_item_limit(params.limit);
    let token_cap = clamp_token_cap(params.token_cap, config.max_expand_tokens);

    let Some(root) = store.get_context_item(&params.summary_id).await? else {
        return Ok(ExpandResult {
            summaries: Vec::new(),
            messages: Vec::new(),
            estimated_tokens: 0,
            truncated: false,
            next_summary_ids: Vec::new(),
        });
    };

    let mut queue: VecDeque<Frontier> = VecDeque::new();
    queue.push_back(Frontier { item: root, depth: 0 });

    let mut visited: HashSet<String> = HashSet::new();
    let mut summaries = Vec::new();
    let mut messages = Vec::new();
    let mut next_summary_ids = Vec::new();
    let mut used_tokens = 0usize;
    let mut item_count = 0usize;
    let mut truncated = false;

    while let Some(Frontier { item, depth }) = queue.pop_front() {
        if !visited.insert(item.item_id.clone()) {
            continue;
        }

        let is_root = depth == 0;
        if !is_root {
            let item_tokens = estimator.estimate_text(&item.body);

            if item_count >= item_limit {
                truncated = true;
                if item.item_type == ContextItemKind::Summary {
                    next_summary_ids.push(item.item_id.clone());
                }
                continue;
            }
            if used_tokens + item_tokens > token_cap {
                truncated = true;
                if item.item_type == ContextItemKind::Summary {
                    next_summary_ids.push(item.item_id.clone());
                }
                continue;
            }

            match item.item_type {
                ContextItemKind::Summary => {
                    used_tokens += item_tokens;
                    item_count += 1;
                    summaries.push(item.clone());
                }
                ContextItemKind::Message => {
                    if params.include_messages {
                        if let Some(message_id) = &item.source_message_id {
                            let found = store
                                .list_messages(&item.conversation_id, Some(vec![message_id.clone()]), Some(1), false)
                                .await?;
                            if let Some(message) = found.into_iter().next() {
                                let message_tokens = estimator.estimate_message(&message);
                                if used_tokens + message_tokens > token_cap || item_count >= item_limit {
                                    truncated = true;
                                    continue;
                                }
                                used_tokens += message_tokens;
                                item_count += 1;
                                messages.push(message);
                            }
                        }
                    }
                    // Message-pointer items are leaves; do not traverse further.
                    continue;
                }
                ContextItemKind::Note | ContextItemKind::Artifact => {
                    continue;
                }
            }
        }

        if depth >= max_depth {
            if depth == max_depth {
                // Frontier at the depth ceiling: its sources would exceed it.
                // Lineage edges point older->newer (spec §3), so a summary's
                // sources are the *parent* endpoints of its incoming edges.
                let parents = store.get_lineage_parents(&item.item_id).await?;
                for edge in parents {
                    if let Some(parent) = store.get_context_item(&edge.parent_item_id).await? {
                        if parent.item_type == ContextItemKind::Summary {
                            truncated = true;
                            next_summary_ids.push(parent.item_id);
                        }
                    }
                }
            }
            continue;
        }

        let parents = store.get_lineage_parents(&item.item_id).await?;
        for edge in parents {
            if visited.contains(&edge.parent_item_id) {
                continue;
            }
            if let Some(parent) = store.get_context_item(&edge.parent_item_id).await? {
                queue.push_back(Frontier { item: parent, depth: depth + 1 });
            }
        }
    }

    next_summary_ids.sort();
    next_summary_ids.dedup();

    Ok(ExpandResult {
        summaries,
        messages,
        estimated_tokens: used_tokens,
        truncated,
        next_summary_ids,
    })
}
