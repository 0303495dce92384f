// engine.rs
// LCM Facade (spec §4.9): the single public entry point wiring the Storage
// Backend, Conversation Store, Token Estimator, Compaction Engine, Retrieval
// Engine, Expansion Auth Registry, and Integrity Checker into the
// `ContextEngine` contract (spec §6.1).
//
// Grounded on the teacher's top-level `ToolContext`/`AppState` aggregation
// (`tools/core/mod.rs`) generalized from a struct of concrete pools into a
// lazily-opened handle over the LCM subsystems, since this crate is a
// library embedded by a host rather than a binary owning its own startup.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::assembler::Assembler;
use crate::compaction::{CompactOutcome, CompactParams, CompactionEngine, CompactionTarget, Summarizer};
use crate::config::LcmConfig;
use crate::db::StorageBackend;
use crate::error::{LcmError, Result};
use crate::estimator::{CharDiv4Estimator, TokenEstimator};
use crate::integrity::IntegrityChecker;
use crate::model::{AssembledMessage, MessageContent, Role};
use crate::retrieval::{ExpansionAuthRegistry, RetrievalEngine};
use crate::store::{new_uuid, ConversationStore, IngestMessageInput as StoreIngestInput, NewMessagePart};

/// One message handed to [`LcmEngine::ingest`]. `message_id` and
/// `created_at_ms` are optional — left unset, the facade assigns a fresh
/// UUIDv4 and the current time, mirroring how a host's chat loop usually
/// only knows the content at ingest time.
#[derive(Debug, Clone)]
pub struct IngestMessage {
    pub message_id: Option<String>,
    pub role: Role,
    pub author_id: Option<String>,
    pub content_text: String,
    pub payload: serde_json::Value,
    pub parts: Vec<NewMessagePart>,
    pub created_at_ms: Option<i64>,
}

impl IngestMessage {
    pub fn new(role: Role, content_text: impl Into<String>) -> Self {
        Self {
            message_id: None,
            role,
            author_id: None,
            content_text: content_text.into(),
            payload: serde_json::json!({}),
            parts: Vec::new(),
            created_at_ms: None,
        }
    }
}

/// `ingest({ sessionId, message, agentId?, isHeartbeat? })` (spec §6.1).
#[derive(Debug, Clone)]
pub struct IngestParams {
    pub session_id: String,
    pub message: IngestMessage,
    pub agent_id: Option<String>,
    pub is_heartbeat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub ingested: bool,
}

/// `ingestBatch({ sessionId, messages[], isHeartbeat? })` (spec §6.1).
#[derive(Debug, Clone)]
pub struct IngestBatchParams {
    pub session_id: String,
    pub messages: Vec<IngestMessage>,
    pub agent_id: Option<String>,
    pub is_heartbeat: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestBatchOutcome {
    pub ingested_count: usize,
}

/// A caller-supplied message, used as the pass-through payload when the
/// engine is disabled or as the basis for provider-facing normalization when
/// enabled (spec §4.9: "assemble → ... or fall through to the caller's
/// message array if configured for pass-through").
#[derive(Debug, Clone)]
pub struct HostMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// `assemble({ sessionId, messages[], tokenBudget? })` (spec §6.1).
#[derive(Debug, Clone)]
pub struct AssembleParams {
    pub session_id: String,
    pub messages: Vec<HostMessage>,
    pub token_budget: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct AssembleOutcome {
    pub messages: Vec<AssembledMessage>,
    pub estimated_tokens: usize,
}

/// `compact({ sessionId, sessionFile, currentTokenCount?, compactionTarget,
/// customInstructions?, tokenBudget? })` (spec §6.1). `session_file` is a
/// provenance breadcrumb from the host's legacy pass-through engine (out of
/// scope collaborator, spec §1); the facade logs it but does not read it.
#[derive(Debug, Clone)]
pub struct FacadeCompactParams {
    pub session_id: String,
    pub session_file: Option<PathBuf>,
    pub current_token_count: Option<usize>,
    pub compaction_target: CompactionTarget,
    pub custom_instructions: Option<String>,
    pub token_budget: Option<usize>,
}

/// The `ContextEngine` contract (spec §6.1), consumed by the host chat
/// runtime. Implemented by [`LcmEngine`].
#[async_trait]
pub trait ContextEngine: Send + Sync {
    async fn ingest(&self, params: IngestParams) -> Result<IngestOutcome>;
    async fn ingest_batch(&self, params: IngestBatchParams) -> Result<IngestBatchOutcome>;
    async fn assemble(&self, params: AssembleParams) -> Result<AssembleOutcome>;
    async fn compact(&self, params: FacadeCompactParams) -> Result<CompactOutcome>;
    async fn dispose(&self) -> Result<()>;
}

/// Fully-wired subsystem handle, built lazily on first use. Held behind an
/// `Arc` so accessor methods (`get_conversation_store`, etc.) can hand out
/// cheap clones without re-opening the backend.
struct Inner {
    backend: Arc<StorageBackend>,
    store: Arc<ConversationStore>,
    estimator: Arc<dyn TokenEstimator>,
    assembler: Arc<Assembler>,
    compaction: CompactionEngine,
    retrieval: Arc<RetrievalEngine>,
    auth: Arc<ExpansionAuthRegistry>,
    config: LcmConfig,
}

/// Single public entry point over the LCM subsystems (spec §4.9). Construct
/// once per host process/agent-state-directory and reuse; internal state
/// (the pool, the in-memory grant registry) is lazily opened on first
/// `ingest`/`assemble`/`compact`/accessor call and torn down by [`dispose`](LcmEngine::dispose).
pub struct LcmEngine {
    config: LcmConfig,
    summarizer: Arc<dyn Summarizer>,
    estimator: Arc<dyn TokenEstimator>,
    inner: tokio::sync::Mutex<Option<Arc<Inner>>>,
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn check_cancelled(token: Option<&CancellationToken>) -> Result<()> {
    if token.map(|t| t.is_cancelled()).unwrap_or(false) {
        return Err(LcmError::Cancelled);
    }
    Ok(())
}

impl LcmEngine {
    /// Construct a facade with the default [`CharDiv4Estimator`]. The
    /// backend is not opened until the first call that needs it.
    pub fn new(config: LcmConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self::with_estimator(config, summarizer, Arc::new(CharDiv4Estimator))
    }

    /// Construct a facade with a caller-supplied [`TokenEstimator`]
    /// (spec §4.2: "swapping it must not change stored data").
    pub fn with_estimator(
        config: LcmConfig,
        summarizer: Arc<dyn Summarizer>,
        estimator: Arc<dyn TokenEstimator>,
    ) -> Self {
        Self {
            config,
            summarizer,
            estimator,
            inner: tokio::sync::Mutex::new(None),
        }
    }

    async fn ensure_open(&self) -> Result<Arc<Inner>> {
        let mut guard = self.inner.lock().await;
        if let Some(inner) = guard.as_ref() {
            return Ok(inner.clone());
        }

        let backend = Arc::new(StorageBackend::open(&self.config.database_path).await?);
        let store = Arc::new(ConversationStore::new(backend.clone()));
        let assembler = Arc::new(Assembler::new(store.clone(), self.estimator.clone()));
        let compaction = CompactionEngine::new(
            store.clone(),
            assembler.clone(),
            self.summarizer.clone(),
            self.config.clone(),
        );
        let auth = Arc::new(ExpansionAuthRegistry::new());
        // The engine's own direct retrieval surface (`get_retrieval_engine`)
        // is unauthenticated: the registry exists to authorize *delegate*
        // sessions (spec §4.6), not the owning host session's own calls.
        // Hosts building a cross-session delegate path should construct
        // their own `RetrievalEngine` with `Some(auth)` via
        // `expansion_auth()`.
        let retrieval = Arc::new(RetrievalEngine::new(
            store.clone(),
            self.estimator.clone(),
            self.config.clone(),
            None,
        ));

        let inner = Arc::new(Inner {
            backend,
            store,
            estimator: self.estimator.clone(),
            assembler,
            compaction,
            retrieval,
            auth,
            config: self.config.clone(),
        });
        *guard = Some(inner.clone());
        Ok(inner)
    }

    /// Direct accessor for the Conversation Store (spec §6.1: hosts MAY call
    /// this for grep/expand/describe-adjacent tooling that needs raw access).
    pub async fn get_conversation_store(&self) -> Result<Arc<ConversationStore>> {
        Ok(self.ensure_open().await?.store.clone())
    }

    /// Alias for [`get_conversation_store`](Self::get_conversation_store):
    /// Summary Items are a subclass of Context Item (spec §3) and have no
    /// separate storage module in this crate.
    pub async fn get_summary_store(&self) -> Result<Arc<ConversationStore>> {
        self.get_conversation_store().await
    }

    /// The engine's unauthenticated Retrieval Engine, for the host's own
    /// same-session tooling.
    pub async fn get_retrieval_engine(&self) -> Result<Arc<RetrievalEngine>> {
        Ok(self.ensure_open().await?.retrieval.clone())
    }

    /// The Expansion Auth Registry, for issuing/revoking cross-session
    /// grants (spec §4.6).
    pub async fn expansion_auth(&self) -> Result<Arc<ExpansionAuthRegistry>> {
        Ok(self.ensure_open().await?.auth.clone())
    }

    /// Builds a fresh, auth-gated `RetrievalEngine` sharing this engine's
    /// store/estimator/config, for hosts serving a delegate session that
    /// must present a grant on every call (spec §4.5 authorization clause).
    pub async fn authorized_retrieval_engine(&self) -> Result<RetrievalEngine> {
        let inner = self.ensure_open().await?;
        Ok(RetrievalEngine::new(
            inner.store.clone(),
            inner.estimator.clone(),
            inner.config.clone(),
            Some(inner.auth.clone()),
        ))
    }

    /// Integrity Checker over this engine's backend (spec §4.8).
    pub async fn integrity_checker(&self) -> Result<IntegrityChecker> {
        Ok(IntegrityChecker::new(self.ensure_open().await?.backend.clone()))
    }

    async fn maybe_autocompact(&self, inner: &Inner, conversation_id: &str) {
        if inner.config.autocompact_disabled {
            return;
        }
        let tokens = match inner.assembler.assemble(conversation_id, None, inner.config.fresh_tail_count).await {
            Ok(assembled) => assembled.estimated_tokens,
            Err(e) => {
                tracing::warn!("autocompact token check failed for {conversation_id}: {e}");
                return;
            }
        };
        if tokens <= inner.config.overflow_token_trigger() {
            return;
        }
        let outcome = inner
            .compaction
            .compact(CompactParams {
                conversation_id: conversation_id.to_string(),
                target: CompactionTarget::Threshold,
                token_budget: None,
                custom_instructions: None,
            })
            .await;
        match outcome {
            Ok(o) if o.compacted => {
                tracing::info!("autocompacted conversation {conversation_id} on overflow ({tokens} tokens)");
            }
            Ok(o) => {
                tracing::debug!("autocompact no-op for {conversation_id}: {:?}", o.reason);
            }
            Err(e) => {
                tracing::warn!("autocompact failed for {conversation_id}: {e}");
            }
        }
    }

    async fn ingest_one(&self, inner: &Inner, session_id: &str, agent_id: Option<&str>, message: IngestMessage) -> Result<()> {
        let message_id = message.message_id.unwrap_or_else(new_uuid);
        let author_id = message.author_id.or_else(|| agent_id.map(str::to_string));
        let created_at_ms = message.created_at_ms.unwrap_or_else(now_ms);

        inner
            .store
            .ingest_message(StoreIngestInput {
                message_id,
                conversation_id: session_id.to_string(),
                role: message.role,
                author_id,
                content_text: message.content_text,
                payload: message.payload,
                parts: message.parts,
                created_at_ms,
            })
            .await?;
        Ok(())
    }

    /// Cancellable variant of [`ContextEngine::ingest`] (spec §5: "every
    /// operation accepts an abort/cancel signal").
    pub async fn ingest_cancellable(&self, params: IngestParams, cancel: Option<CancellationToken>) -> Result<IngestOutcome> {
        if !self.config.enabled {
            return Ok(IngestOutcome { ingested: false });
        }
        check_cancelled(cancel.as_ref())?;
        let inner = self.ensure_open().await?;
        inner
            .store
            .ensure_conversation(&params.session_id, &params.session_id, None, now_ms())
            .await?;

        check_cancelled(cancel.as_ref())?;
        self.ingest_one(&inner, &params.session_id, params.agent_id.as_deref(), params.message)
            .await?;

        if !params.is_heartbeat {
            check_cancelled(cancel.as_ref())?;
            self.maybe_autocompact(&inner, &params.session_id).await;
        }

        Ok(IngestOutcome { ingested: true })
    }

    /// Cancellable variant of [`ContextEngine::ingest_batch`].
    pub async fn ingest_batch_cancellable(
        &self,
        params: IngestBatchParams,
        cancel: Option<CancellationToken>,
    ) -> Result<IngestBatchOutcome> {
        if !self.config.enabled {
            return Ok(IngestBatchOutcome { ingested_count: 0 });
        }
        check_cancelled(cancel.as_ref())?;
        let inner = self.ensure_open().await?;
        inner
            .store
            .ensure_conversation(&params.session_id, &params.session_id, None, now_ms())
            .await?;

        let mut ingested_count = 0usize;
        for message in params.messages {
            check_cancelled(cancel.as_ref())?;
            self.ingest_one(&inner, &params.session_id, params.agent_id.as_deref(), message)
                .await?;
            ingested_count += 1;
        }

        if !params.is_heartbeat && ingested_count > 0 {
            check_cancelled(cancel.as_ref())?;
            self.maybe_autocompact(&inner, &params.session_id).await;
        }

        Ok(IngestBatchOutcome { ingested_count })
    }

    fn pass_through_assemble(&self, messages: Vec<HostMessage>) -> AssembleOutcome {
        let messages: Vec<AssembledMessage> = messages
            .into_iter()
            .enumerate()
            .map(|(i, m)| AssembledMessage {
                role: m.role,
                content: m.content,
                source_item_id: format!("passthrough-{i}"),
                tool_call_ids: Vec::new(),
                tool_result_for: None,
            })
            .collect();
        let estimated_tokens = messages
            .iter()
            .map(|m| self.estimator.estimate_text(&m.content.as_text()))
            .sum();
        AssembleOutcome {
            messages,
            estimated_tokens,
        }
    }

    /// Cancellable variant of [`ContextEngine::assemble`].
    pub async fn assemble_cancellable(&self, params: AssembleParams, cancel: Option<CancellationToken>) -> Result<AssembleOutcome> {
        check_cancelled(cancel.as_ref())?;
        if !self.config.enabled {
            return Ok(self.pass_through_assemble(params.messages));
        }
        let inner = self.ensure_open().await?;
        let assembled = inner
            .assembler
            .assemble(&params.session_id, params.token_budget, inner.config.fresh_tail_count)
            .await?;
        Ok(AssembleOutcome {
            messages: assembled.messages,
            estimated_tokens: assembled.estimated_tokens,
        })
    }

    /// Cancellable variant of [`ContextEngine::compact`].
    pub async fn compact_cancellable(&self, params: FacadeCompactParams, cancel: Option<CancellationToken>) -> Result<CompactOutcome> {
        if !self.config.enabled {
            return Ok(CompactOutcome {
                ok: true,
                compacted: false,
                reason: Some("engine disabled".to_string()),
                result: None,
            });
        }
        if let Some(path) = &params.session_file {
            tracing::debug!(session_file = %path.display(), "compact invoked with host session file reference");
        }
        if let Some(reported) = params.current_token_count {
            tracing::debug!(reported_tokens = reported, "compact called with host-reported token count");
        }
        check_cancelled(cancel.as_ref())?;
        let inner = self.ensure_open().await?;
        check_cancelled(cancel.as_ref())?;
        inner
            .compaction
            .compact(CompactParams {
                conversation_id: params.session_id,
                target: params.compaction_target,
                token_budget: params.token_budget,
                custom_instructions: params.custom_instructions,
            })
            .await
    }
}

#[async_trait]
impl ContextEngine for LcmEngine {
    async fn ingest(&self, params: IngestParams) -> Result<IngestOutcome> {
        self.ingest_cancellable(params, None).await
    }

    async fn ingest_batch(&self, params: IngestBatchParams) -> Result<IngestBatchOutcome> {
        self.ingest_batch_cancellable(params, None).await
    }

    async fn assemble(&self, params: AssembleParams) -> Result<AssembleOutcome> {
        self.assemble_cancellable(params, None).await
    }

    async fn compact(&self, params: FacadeCompactParams) -> Result<CompactOutcome> {
        self.compact_cancellable(params, None).await
    }

    /// Drops the open backend/pool and in-memory grant registry. The next
    /// call lazily reopens (spec §4.9: "dispose → close backend").
    async fn dispose(&self) -> Result<()> {
        let mut guard = self.inner.lock().await;
        *guard = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compaction::FixedSummarizer;

    fn engine_with(config: LcmConfig) -> LcmEngine {
        LcmEngine::new(config, Arc::new(FixedSummarizer::default()))
    }

    fn temp_config() -> (tempfile::TempDir, LcmConfig) {
        let dir = tempfile::tempdir().unwrap();
        let config = LcmConfig {
            database_path: dir.path().join("lcm.sqlite"),
            fresh_tail_count: 2,
            ..Default::default()
        };
        (dir, config)
    }

    #[tokio::test]
    async fn test_ingest_then_assemble_roundtrip() {
        let (_dir, config) = temp_config();
        let engine = engine_with(config);

        for (role, text) in [
            (Role::User, "hi"),
            (Role::Assistant, "hello"),
            (Role::Tool, "result"),
            (Role::Assistant, "done"),
        ] {
            let outcome = engine
                .ingest(IngestParams {
                    session_id: "s1".into(),
                    message: IngestMessage::new(role, text),
                    agent_id: None,
                    is_heartbeat: false,
                })
                .await
                .unwrap();
            assert!(outcome.ingested);
        }

        let store = engine.get_conversation_store().await.unwrap();
        let messages = store.list_messages("s1", None, None, false).await.unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages.iter().map(|m| m.ordinal).collect::<Vec<_>>(), vec![0, 1, 2, 3]);

        let assembled = engine
            .assemble(AssembleParams {
                session_id: "s1".into(),
                messages: Vec::new(),
                token_budget: None,
            })
            .await
            .unwrap();
        assert_eq!(assembled.messages.len(), 4);
    }

    #[tokio::test]
    async fn test_ingest_idempotent_on_same_message_id() {
        let (_dir, config) = temp_config();
        let engine = engine_with(config);

        let mut msg = IngestMessage::new(Role::User, "hi");
        msg.message_id = Some("fixed-id".into());
        engine
            .ingest(IngestParams {
                session_id: "s1".into(),
                message: msg.clone(),
                agent_id: None,
                is_heartbeat: false,
            })
            .await
            .unwrap();
        engine
            .ingest(IngestParams {
                session_id: "s1".into(),
                message: msg,
                agent_id: None,
                is_heartbeat: false,
            })
            .await
            .unwrap();

        let store = engine.get_conversation_store().await.unwrap();
        let messages = store.list_messages("s1", None, None, false).await.unwrap();
        assert_eq!(messages.len(), 1);
    }

    #[tokio::test]
    async fn test_disabled_engine_ingest_is_noop_and_assemble_passes_through() {
        let (_dir, mut config) = temp_config();
        config.enabled = false;
        let engine = engine_with(config);

        let outcome = engine
            .ingest(IngestParams {
                session_id: "s1".into(),
                message: IngestMessage::new(Role::User, "hi"),
                agent_id: None,
                is_heartbeat: false,
            })
            .await
            .unwrap();
        assert!(!outcome.ingested);

        let assembled = engine
            .assemble(AssembleParams {
                session_id: "s1".into(),
                messages: vec![HostMessage {
                    role: Role::User,
                    content: MessageContent::Text("hi".into()),
                }],
                token_budget: None,
            })
            .await
            .unwrap();
        assert_eq!(assembled.messages.len(), 1);
        assert!(assembled.estimated_tokens > 0);
    }

    #[tokio::test]
    async fn test_ingest_batch_counts_all_messages() {
        let (_dir, config) = temp_config();
        let engine = engine_with(config);

        let outcome = engine
            .ingest_batch(IngestBatchParams {
                session_id: "s1".into(),
                messages: vec![
                    IngestMessage::new(Role::User, "one"),
                    IngestMessage::new(Role::Assistant, "two"),
                ],
                agent_id: None,
                is_heartbeat: false,
            })
            .await
            .unwrap();
        assert_eq!(outcome.ingested_count, 2);
    }

    #[tokio::test]
    async fn test_autocompact_triggers_on_overflow_during_ingest() {
        let (_dir, mut config) = temp_config();
        config.model_token_budget = 200;
        config.context_threshold = 0.5;
        config.leaf_batch_size = 6;
        let engine = engine_with(config);

        for i in 0..12 {
            engine
                .ingest(IngestParams {
                    session_id: "s1".into(),
                    message: IngestMessage::new(Role::User, &"x".repeat(200 + i)),
                    agent_id: None,
                    is_heartbeat: false,
                })
                .await
                .unwrap();
        }

        let store = engine.get_conversation_store().await.unwrap();
        let active = store.get_context_items("s1", false, None, None).await.unwrap();
        assert!(
            active.iter().any(|item| item.item_type == crate::model::ContextItemKind::Summary),
            "expected autocompaction to have produced a summary item"
        );
    }

    #[tokio::test]
    async fn test_heartbeat_ingest_skips_autocompact() {
        let (_dir, mut config) = temp_config();
        config.model_token_budget = 200;
        config.context_threshold = 0.5;
        let engine = engine_with(config);

        for i in 0..12 {
            engine
                .ingest(IngestParams {
                    session_id: "s1".into(),
                    message: IngestMessage::new(Role::User, &"x".repeat(200 + i)),
                    agent_id: None,
                    is_heartbeat: true,
                })
                .await
                .unwrap();
        }

        let store = engine.get_conversation_store().await.unwrap();
        let active = store.get_context_items("s1", false, None, None).await.unwrap();
        assert!(active.iter().all(|item| item.item_type != crate::model::ContextItemKind::Summary));
    }

    #[tokio::test]
    async fn test_dispose_allows_reopen() {
        let (_dir, config) = temp_config();
        let engine = engine_with(config);
        engine
            .ingest(IngestParams {
                session_id: "s1".into(),
                message: IngestMessage::new(Role::User, "hi"),
                agent_id: None,
                is_heartbeat: false,
            })
            .await
            .unwrap();
        engine.dispose().await.unwrap();

        let store = engine.get_conversation_store().await.unwrap();
        let messages = store.list_messages("s1", None, None, false).await.unwrap();
        assert_eq!(messages.len(), 1, "data on disk survives dispose/reopen");
    }

    #[tokio::test]
    async fn test_cancelled_token_aborts_before_write() {
        let (_dir, config) = temp_config();
        let engine = engine_with(config);
        let token = CancellationToken::new();
        token.cancel();

        let err = engine
            .ingest_cancellable(
                IngestParams {
                    session_id: "s1".into(),
                    message: IngestMessage::new(Role::User, "hi"),
                    agent_id: None,
                    is_heartbeat: false,
                },
                Some(token),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LcmError::Cancelled));
    }
}
