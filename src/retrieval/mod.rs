// retrieval/mod.rs
// Retrieval Engine (spec §4.5): read-only queries over the full conversation
// history, including tombstoned items. Optionally gated by an
// ExpansionAuthRegistry when the facade is configured with one.

pub mod auth;
pub mod describe;
pub mod expand;
pub mod grep;

pub use auth::{AuthorizeParams, ExpansionAuthRegistry, IssueGrantParams};
pub use describe::{Describe, FileDescribe, SummaryDescribe};
pub use expand::{ExpandParams, ExpandResult, MAX_EXPAND_DEPTH};
pub use grep::{GrepMode, GrepParams, GrepResult, GrepScope};

use std::sync::Arc;

use crate::config::LcmConfig;
use crate::error::Result;
use crate::estimator::TokenEstimator;
use crate::store::ConversationStore;

/// Facade combining the four retrieval operations over a shared store,
/// estimator, and config, with an optional auth registry consulted before
/// every call when present.
pub struct RetrievalEngine {
    store: Arc<ConversationStore>,
    estimator: Arc<dyn TokenEstimator>,
    config: LcmConfig,
    auth: Option<Arc<ExpansionAuthRegistry>>,
}

impl RetrievalEngine {
    pub fn new(
        store: Arc<ConversationStore>,
        estimator: Arc<dyn TokenEstimator>,
        config: LcmConfig,
        auth: Option<Arc<ExpansionAuthRegistry>>,
    ) -> Self {
        Self {
            store,
            estimator,
            config,
            auth,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn check_auth(
        &self,
        session_key: Option<&str>,
        conversation_id: Option<&str>,
        summary_id: Option<&str>,
        depth: Option<u32>,
        token_cap: Option<usize>,
        now_ms: i64,
    ) -> Result<()> {
        let Some(registry) = &self.auth else {
            return Ok(());
        };
        let Some(session_key) = session_key else {
            return Err(crate::error::LcmError::AuthorizationFailed(
                crate::error::AuthFailureCode::Missing,
            ));
        };
        registry.authorize(&AuthorizeParams {
            session_key: session_key.to_string(),
            conversation_id: conversation_id.map(|s| s.to_string()),
            summary_id: summary_id.map(|s| s.to_string()),
            depth,
            token_cap,
            now_ms,
        })?;
        Ok(())
    }

    /// Resolves `id` first so authorization can be checked against its real
    /// `conversation_id` (and, for scoped grants, against
    /// `grant.allowed_summary_ids`) instead of an unconditional `None` scope
    /// that a configured registry can never satisfy (spec §4.5/§4.6).
    pub async fn describe(&self, id: &str, session_key: Option<&str>, now_ms: i64) -> Result<Option<Describe>> {
        let result = describe::describe(&self.store, self.estimator.clone(), id).await?;
        let conversation_id = result.as_ref().map(|d| match d {
            Describe::Summary(s) => s.conversation_id.as_str(),
            Describe::File(f) => f.conversation_id.as_str(),
        });
        self.check_auth(session_key, conversation_id, Some(id), None, None, now_ms)?;
        Ok(result)
    }

    pub async fn grep(&self, params: GrepParams, session_key: Option<&str>, now_ms: i64) -> Result<GrepResult> {
        self.check_auth(session_key, params.conversation_id.as_deref(), None, None, None, now_ms)?;
        grep::grep(&self.store, params).await
    }

    pub async fn expand(
        &self,
        params: ExpandParams,
        conversation_id: Option<&str>,
        session_key: Option<&str>,
        now_ms: i64,
    ) -> Result<ExpandResult> {
        self.check_auth(
            session_key,
            conversation_id,
            Some(params.summary_id.as_str()),
            params.depth,
            params.token_cap,
            now_ms,
        )?;
        expand::expand(&self.store, &self.estimator, &self.config, params).await
    }
}
