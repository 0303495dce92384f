// compaction/engine.rs
// Compaction Engine (spec §4.4): two-tier (leaf/condensed) summarization that
// keeps active context below a token budget, append-first and tombstone-only.
//
// Grounded on the teacher's rolling-summarization pipeline
// (`web/chat/summarization.rs::perform_rolling_summarization`/`promote_summaries`)
// generalized from "delete source rows after summarizing" to
// "tombstone + lineage-link", since the LCM model never deletes canonical
// history.

use std::sync::Arc;

use chrono::Utc;

use crate::assembler::Assembler;
use crate::config::LcmConfig;
use crate::error::{LcmError, Result};
use crate::model::{ContextItem, ContextItemKind};
use crate::store::{ConversationStore, NewContextItem, ReplaceRangeParams};

use super::summarizer::{SummarizeInput, SummarizeRequest, Summarizer, SummarizerFailureKind};

/// What triggered this `compact()` call, mirroring the two declared triggers
/// in spec §4.4 ("overflow" is modeled by the caller choosing `Threshold`
/// with no explicit budget; "manual" by choosing `Budget` with one).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionTarget {
    Budget,
    Threshold,
}

#[derive(Debug, Clone)]
pub struct CompactParams {
    pub conversation_id: String,
    pub target: CompactionTarget,
    /// Required semantics when `target == Budget`; ignored (derived from
    /// config) when `target == Threshold`.
    pub token_budget: Option<usize>,
    pub custom_instructions: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct CompactDetail {
    pub leaf_summaries_created: usize,
    pub condensed_summaries_created: usize,
    pub items_tombstoned: usize,
    pub passes_run: usize,
}

#[derive(Debug, Clone)]
pub struct CompactResult {
    /// The most recently created summary this call produced.
    pub summary: ContextItem,
    pub first_kept_entry_id: Option<String>,
    pub tokens_before: usize,
    pub tokens_after: Option<usize>,
    pub details: CompactDetail,
}

#[derive(Debug, Clone)]
pub struct CompactOutcome {
    pub ok: bool,
    pub compacted: bool,
    pub reason: Option<String>,
    pub result: Option<CompactResult>,
}

impl CompactOutcome {
    fn no_op(reason: impl Into<String>) -> Self {
        Self {
            ok: true,
            compacted: false,
            reason: Some(reason.into()),
            result: None,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            ok: false,
            compacted: false,
            reason: Some(reason.into()),
            result: None,
        }
    }
}

pub struct CompactionEngine {
    store: Arc<ConversationStore>,
    assembler: Arc<Assembler>,
    summarizer: Arc<dyn Summarizer>,
    config: LcmConfig,
}

/// A maximal run of adjacent prefix items all satisfying the same batching
/// predicate (all raw messages, or all depth-1 leaf summaries).
struct Run<'a> {
    items: Vec<&'a ContextItem>,
}

fn find_runs<'a, F>(items: &'a [ContextItem], pred: F) -> Vec<Run<'a>>
where
    F: Fn(&ContextItem) -> bool,
{
    let mut runs = Vec::new();
    let mut current: Vec<&ContextItem> = Vec::new();
    for item in items {
        if pred(item) {
            current.push(item);
        } else if !current.is_empty() {
            runs.push(Run { items: std::mem::take(&mut current) });
        }
    }
    if !current.is_empty() {
        runs.push(Run { items: current });
    }
    runs
}

fn chunk_run<'a>(run: &Run<'a>, batch_size: usize) -> Vec<Vec<&'a ContextItem>> {
    run.items
        .chunks(batch_size.max(1))
        .map(|c| c.to_vec())
        .collect()
}

impl CompactionEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        assembler: Arc<Assembler>,
        summarizer: Arc<dyn Summarizer>,
        config: LcmConfig,
    ) -> Self {
        Self {
            store,
            assembler,
            summarizer,
            config,
        }
    }

    fn effective_budget(&self, params: &CompactParams) -> usize {
        match params.target {
            CompactionTarget::Threshold => self.config.overflow_token_trigger(),
            CompactionTarget::Budget => params
                .token_budget
                .unwrap_or_else(|| self.config.overflow_token_trigger()),
        }
    }

    async fn active_tokens(&self, conversation_id: &str) -> Result<usize> {
        Ok(self
            .assembler
            .assemble(conversation_id, None, 0)
            .await?
            .estimated_tokens)
    }

    /// Runs the bounded multi-pass compaction loop described in spec §4.4.
    pub async fn compact(&self, params: CompactParams) -> Result<CompactOutcome> {
        let budget = self.effective_budget(&params);
        let tokens_before = self.active_tokens(&params.conversation_id).await?;

        if tokens_before <= budget {
            return Ok(CompactOutcome::no_op("already below threshold"));
        }

        let mut details = CompactDetail::default();
        let mut last_summary: Option<ContextItem> = None;

        for _pass in 0..self.config.max_compaction_passes {
            let current_tokens = self.active_tokens(&params.conversation_id).await?;
            if current_tokens <= budget {
                break;
            }

            let items = self
                .store
                .get_context_items(&params.conversation_id, false, None, None)
                .await?;
            let prefix_len = items.len().saturating_sub(self.config.fresh_tail_count);
            if prefix_len == 0 {
                if last_summary.is_none() {
                    return Ok(CompactOutcome::no_op("no compactable range outside fresh tail"));
                }
                break;
            }
            let prefix = &items[..prefix_len];

            let leaf_runs = find_runs(prefix, |item| item.item_type == ContextItemKind::Message);
            let tier_result = if !leaf_runs.is_empty() {
                self.run_leaf_tier(&params, &leaf_runs, &mut details, &mut last_summary).await
            } else {
                let condensed_runs =
                    find_runs(prefix, |item| item.item_type == ContextItemKind::Summary && item.depth == 1);
                if condensed_runs.is_empty() {
                    if last_summary.is_none() {
                        return Ok(CompactOutcome::no_op("no compactable range outside fresh tail"));
                    }
                    Ok(false)
                } else {
                    self.run_condensed_tier(&params, &condensed_runs, &mut details, &mut last_summary)
                        .await
                }
            };

            // Spec §4.4/§7: a summarizer failure must surface as
            // `{ok:false, compacted:false, reason}`, never as a propagated
            // error — and it must not have mutated storage, which holds here
            // because the summarizer call always precedes `commit_chunk`.
            let progressed = match tier_result {
                Ok(progressed) => progressed,
                Err(e @ (LcmError::SummarizerFailed(_) | LcmError::SummarizerTimeout)) => {
                    return Ok(CompactOutcome::failed(e.to_user_string()));
                }
                Err(e) => return Err(e),
            };

            details.passes_run += 1;
            if !progressed {
                break;
            }
        }

        let Some(summary) = last_summary else {
            return Ok(CompactOutcome::no_op("no compactable range outside fresh tail"));
        };

        let tokens_after = self.active_tokens(&params.conversation_id).await.ok();
        let tokens_after = tokens_after.filter(|after| *after <= tokens_before);

        let items = self
            .store
            .get_context_items(&params.conversation_id, false, None, None)
            .await?;
        let fresh_tail_start = items.len().saturating_sub(self.config.fresh_tail_count);
        let first_kept_entry_id = items.get(fresh_tail_start).map(|i| i.item_id.clone());

        Ok(CompactOutcome {
            ok: true,
            compacted: true,
            reason: None,
            result: Some(CompactResult {
                summary,
                first_kept_entry_id,
                tokens_before,
                tokens_after,
                details,
            }),
        })
    }

    async fn run_leaf_tier(
        &self,
        params: &CompactParams,
        runs: &[Run<'_>],
        details: &mut CompactDetail,
        last_summary: &mut Option<ContextItem>,
    ) -> Result<bool> {
        let mut progressed = false;
        for run in runs {
            for chunk in chunk_run(run, self.config.leaf_batch_size) {
                let messages: Vec<crate::model::Message> = {
                    let message_ids: Vec<String> = chunk
                        .iter()
                        .filter_map(|item| item.source_message_id.clone())
                        .collect();
                    if message_ids.is_empty() {
                        continue;
                    }
                    self.store
                        .list_messages(&params.conversation_id, Some(message_ids), None, false)
                        .await?
                };
                if messages.is_empty() {
                    continue;
                }

                let request = SummarizeRequest {
                    input: SummarizeInput::Messages(messages.clone()),
                    target_tokens: self.config.leaf_target_tokens,
                    custom_instructions: params.custom_instructions.clone(),
                    timeout_ms: 30_000,
                };

                match self.summarizer.summarize(request).await {
                    Ok(response) => {
                        let summary = self
                            .commit_chunk(
                                params,
                                &chunk,
                                1,
                                response.summary_text,
                                messages.iter().map(|m| m.message_id.clone()).collect(),
                                Vec::new(),
                            )
                            .await?;
                        *last_summary = Some(summary);
                        details.leaf_summaries_created += 1;
                        details.items_tombstoned += chunk.len();
                        progressed = true;
                    }
                    Err(failure) => {
                        return Err(summarizer_failure_to_error(failure));
                    }
                }
            }
        }
        Ok(progressed)
    }

    async fn run_condensed_tier(
        &self,
        params: &CompactParams,
        runs: &[Run<'_>],
        details: &mut CompactDetail,
        last_summary: &mut Option<ContextItem>,
    ) -> Result<bool> {
        let mut progressed = false;
        for run in runs {
            for chunk in chunk_run(run, self.config.condensed_batch_size) {
                if chunk.len() < 2 {
                    // A lone leaf summary gains nothing from condensing further.
                    continue;
                }
                let bodies: Vec<String> = chunk.iter().map(|item| item.body.clone()).collect();
                let request = SummarizeRequest {
                    input: SummarizeInput::LeafSummaries(bodies),
                    target_tokens: self.config.condensed_target_tokens,
                    custom_instructions: params.custom_instructions.clone(),
                    timeout_ms: 30_000,
                };

                match self.summarizer.summarize(request).await {
                    Ok(response) => {
                        let parent_ids: Vec<String> = chunk.iter().map(|item| item.item_id.clone()).collect();
                        let summary = self
                            .commit_chunk(
                                params,
                                &chunk,
                                2,
                                response.summary_text,
                                Vec::new(),
                                parent_ids,
                            )
                            .await?;
                        *last_summary = Some(summary);
                        details.condensed_summaries_created += 1;
                        details.items_tombstoned += chunk.len();
                        progressed = true;
                    }
                    Err(failure) => {
                        return Err(summarizer_failure_to_error(failure));
                    }
                }
            }
        }
        Ok(progressed)
    }

    async fn commit_chunk(
        &self,
        params: &CompactParams,
        chunk: &[&ContextItem],
        depth: i64,
        summary_text: String,
        message_ids: Vec<String>,
        parent_summary_ids: Vec<String>,
    ) -> Result<ContextItem> {
        let now_ms = Utc::now().timestamp_millis();
        let summary_id = crate::store::new_uuid();
        let first = chunk.first().expect("chunk is non-empty");
        let last = chunk.last().expect("chunk is non-empty");

        // The summary replaces this chunk in-place (spec §2/§4.4): it must
        // sort where the chunk sorted, not at wall-clock "now", or it would
        // land after the fresh tail and get swept into the next pass's
        // compactable prefix instead of protecting it (I8).
        let new_item = NewContextItem {
            item_id: summary_id,
            conversation_id: params.conversation_id.clone(),
            depth,
            title: None,
            body: summary_text,
            metadata: serde_json::json!({}),
            created_at_ms: first.created_at_ms,
            updated_at_ms: now_ms,
        };

        let range = ReplaceRangeParams {
            conversation_id: params.conversation_id.clone(),
            summary_id: new_item.item_id.clone(),
            start_item_id: first.item_id.clone(),
            end_item_id: last.item_id.clone(),
            updated_at_ms: now_ms,
            metadata: serde_json::json!({}),
        };

        let (summary, _tombstoned) = self
            .store
            .commit_compaction(new_item, message_ids, parent_summary_ids, range)
            .await?;
        Ok(summary)
    }
}

fn summarizer_failure_to_error(failure: super::summarizer::SummarizerFailure) -> LcmError {
    match failure.kind {
        SummarizerFailureKind::Timeout => LcmError::SummarizerTimeout,
        SummarizerFailureKind::Error => LcmError::SummarizerFailed(failure.message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::StorageBackend;
    use crate::estimator::CharDiv4Estimator;
    use crate::model::Role;
    use crate::store::NewMessage;
    use crate::compaction::summarizer::{FailingSummarizer, FixedSummarizer, SummarizerFailure};

    async fn setup(config: LcmConfig) -> (Arc<ConversationStore>, CompactionEngine) {
        let backend = Arc::new(StorageBackend::open_in_memory().await.unwrap());
        let store = Arc::new(ConversationStore::new(backend));
        store.ensure_conversation("c1", "s1", None, 0).await.unwrap();
        let estimator = Arc::new(CharDiv4Estimator);
        let assembler = Arc::new(Assembler::new(store.clone(), estimator.clone()));
        let summarizer = Arc::new(FixedSummarizer::default());
        let engine = CompactionEngine::new(store.clone(), assembler, summarizer, config);
        (store, engine)
    }

    async fn seed_message(store: &ConversationStore, id: &str, ordinal: i64, text: &str) {
        store
            .create_message(NewMessage {
                message_id: id.into(),
                conversation_id: "c1".into(),
                ordinal,
                role: Role::User,
                author_id: None,
                content_text: text.into(),
                payload: serde_json::json!({}),
                created_at_ms: ordinal,
            })
            .await
            .unwrap();
        store.append_context_message("c1", id, ordinal).await.unwrap();
    }

    fn small_config() -> LcmConfig {
        LcmConfig {
            fresh_tail_count: 2,
            leaf_batch_size: 6,
            condensed_batch_size: 3,
            max_compaction_passes: 4,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_already_below_threshold_is_no_op() {
        let (store, engine) = setup(small_config()).await;
        seed_message(&store, "m0", 0, "hi").await;
        let outcome = engine
            .compact(CompactParams {
                conversation_id: "c1".into(),
                target: CompactionTarget::Budget,
                token_budget: Some(1_000_000),
                custom_instructions: None,
            })
            .await
            .unwrap();
        assert!(outcome.ok);
        assert!(!outcome.compacted);
        assert_eq!(outcome.reason.as_deref(), Some("already below threshold"));
    }

    #[tokio::test]
    async fn test_compacts_leaf_tier_and_tombstones_sources() {
        let (store, engine) = setup(small_config()).await;
        for i in 0..12 {
            seed_message(&store, &format!("m{i}"), i, &"x".repeat(400)).await;
        }
        let outcome = engine
            .compact(CompactParams {
                conversation_id: "c1".into(),
                target: CompactionTarget::Budget,
                token_budget: Some(50),
                custom_instructions: None,
            })
            .await
            .unwrap();
        assert!(outcome.ok);
        assert!(outcome.compacted);
        let result = outcome.result.unwrap();
        assert!(result.details.leaf_summaries_created >= 1);
        assert!(result.details.items_tombstoned >= 1);

        let active = store.get_context_items("c1", false, None, None).await.unwrap();
        assert!(active.iter().any(|i| i.item_type == ContextItemKind::Summary));
    }

    #[tokio::test]
    async fn test_summarizer_failure_reports_ok_false_without_mutation() {
        let backend = Arc::new(StorageBackend::open_in_memory().await.unwrap());
        let store = Arc::new(ConversationStore::new(backend));
        store.ensure_conversation("c1", "s1", None, 0).await.unwrap();
        let estimator = Arc::new(CharDiv4Estimator);
        let assembler = Arc::new(Assembler::new(store.clone(), estimator));
        let summarizer = Arc::new(FailingSummarizer {
            failure: SummarizerFailure::error("boom"),
        });
        let engine = CompactionEngine::new(store.clone(), assembler, summarizer, small_config());

        for i in 0..12 {
            seed_message(&store, &format!("m{i}"), i, &"x".repeat(400)).await;
        }

        // Spec §4.4/§7: a failed summarization is a typed `{ok:false,
        // compacted:false, reason}` result, not a propagated error, and
        // storage is left untouched.
        let outcome = engine
            .compact(CompactParams {
                conversation_id: "c1".into(),
                target: CompactionTarget::Budget,
                token_budget: Some(50),
                custom_instructions: None,
            })
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert!(!outcome.compacted);
        assert!(outcome.reason.is_some());

        let active = store.get_context_items("c1", false, None, None).await.unwrap();
        assert_eq!(active.len(), 12);
        assert!(active.iter().all(|i| !i.tombstoned));
    }

    #[tokio::test]
    async fn test_summarizer_timeout_reports_ok_false_without_mutation() {
        let backend = Arc::new(StorageBackend::open_in_memory().await.unwrap());
        let store = Arc::new(ConversationStore::new(backend));
        store.ensure_conversation("c1", "s1", None, 0).await.unwrap();
        let estimator = Arc::new(CharDiv4Estimator);
        let assembler = Arc::new(Assembler::new(store.clone(), estimator));
        let summarizer = Arc::new(FailingSummarizer {
            failure: SummarizerFailure::timeout("too slow"),
        });
        let engine = CompactionEngine::new(store.clone(), assembler, summarizer, small_config());

        for i in 0..12 {
            seed_message(&store, &format!("m{i}"), i, &"x".repeat(400)).await;
        }

        let outcome = engine
            .compact(CompactParams {
                conversation_id: "c1".into(),
                target: CompactionTarget::Budget,
                token_budget: Some(50),
                custom_instructions: None,
            })
            .await
            .unwrap();
        assert!(!outcome.ok);
        assert!(!outcome.compacted);

        let active = store.get_context_items("c1", false, None, None).await.unwrap();
        assert_eq!(active.len(), 12);
    }

    #[tokio::test]
    async fn test_no_compactable_range_outside_fresh_tail() {
        let config = LcmConfig {
            fresh_tail_count: 20,
            ..small_config()
        };
        let (store, engine) = setup(config).await;
        for i in 0..5 {
            seed_message(&store, &format!("m{i}"), i, &"x".repeat(400)).await;
        }
        let outcome = engine
            .compact(CompactParams {
                conversation_id: "c1".into(),
                target: CompactionTarget::Budget,
                token_budget: Some(1),
                custom_instructions: None,
            })
            .await
            .unwrap();
        assert!(outcome.ok);
        assert!(!outcome.compacted);
        assert_eq!(outcome.reason.as_deref(), Some("no compactable range outside fresh tail"));
    }
}
