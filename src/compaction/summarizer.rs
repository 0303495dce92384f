// compaction/summarizer.rs
// The Summarizer collaborator (spec §6.2): an external, swappable LLM call.
// Grounded on the teacher's `Arc<dyn LlmClient>` provider abstraction
// (`llm/provider.rs`) — a trait object injected into the engine so tests can
// supply a deterministic double instead of calling out to a real model.

use async_trait::async_trait;

use crate::model::Message;

/// What is being summarized: a batch of raw canonical messages (leaf tier)
/// or a batch of prior leaf/condensed summary bodies (condensed tier).
#[derive(Debug, Clone)]
pub enum SummarizeInput {
    Messages(Vec<Message>),
    LeafSummaries(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct SummarizeRequest {
    pub input: SummarizeInput,
    pub target_tokens: usize,
    pub custom_instructions: Option<String>,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizeResponse {
    pub summary_text: String,
    pub tokens_before: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummarizerFailureKind {
    Timeout,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizerFailure {
    pub kind: SummarizerFailureKind,
    pub message: String,
}

impl SummarizerFailure {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: SummarizerFailureKind::Error,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: SummarizerFailureKind::Timeout,
            message: message.into(),
        }
    }
}

/// External collaborator: must not persist or mutate LCM state, and need not
/// be deterministic on identical inputs (spec §6.2).
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, req: SummarizeRequest) -> Result<SummarizeResponse, SummarizerFailure>;
}

/// Deterministic test double: concatenates a fixed prefix with the source
/// text, truncated to `target_tokens * 4` chars (the inverse of the default
/// char/4 estimator). Useful for unit/integration tests that assert on
/// summary content without wiring up a real LLM call.
pub struct FixedSummarizer {
    pub prefix: String,
}

impl Default for FixedSummarizer {
    fn default() -> Self {
        Self {
            prefix: "Summary:".to_string(),
        }
    }
}

#[async_trait]
impl Summarizer for FixedSummarizer {
    async fn summarize(&self, req: SummarizeRequest) -> Result<SummarizeResponse, SummarizerFailure> {
        let (joined, tokens_before) = match &req.input {
            SummarizeInput::Messages(messages) => {
                let joined = messages
                    .iter()
                    .map(|m| format!("{}: {}", m.role, m.content_text))
                    .collect::<Vec<_>>()
                    .join("\n");
                let tokens = messages.iter().map(|m| m.content_text.chars().count().div_ceil(4)).sum();
                (joined, tokens)
            }
            SummarizeInput::LeafSummaries(bodies) => {
                let joined = bodies.join("\n");
                let tokens = bodies.iter().map(|b| b.chars().count().div_ceil(4)).sum();
                (joined, tokens)
            }
        };

        let max_chars = req.target_tokens.saturating_mul(4).max(1);
        let truncated: String = joined.chars().take(max_chars).collect();
        Ok(SummarizeResponse {
            summary_text: format!("{} {}", self.prefix, truncated),
            tokens_before,
        })
    }
}

/// Test double that always fails, for exercising compaction's
/// `{ok:false, compacted:false}` failure path without mutating storage.
pub struct FailingSummarizer {
    pub failure: SummarizerFailure,
}

#[async_trait]
impl Summarizer for FailingSummarizer {
    async fn summarize(&self, _req: SummarizeRequest) -> Result<SummarizeResponse, SummarizerFailure> {
        Err(self.failure.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;

    fn msg(text: &str) -> Message {
        Message {
            message_id: "m".into(),
            conversation_id: "c".into(),
            ordinal: 0,
            role: Role::User,
            author_id: None,
            content_text: text.into(),
            payload: serde_json::json!({}),
            created_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_fixed_summarizer_produces_prefixed_text() {
        let s = FixedSummarizer::default();
        let resp = s
            .summarize(SummarizeRequest {
                input: SummarizeInput::Messages(vec![msg("hello world")]),
                target_tokens: 100,
                custom_instructions: None,
                timeout_ms: 1000,
            })
            .await
            .unwrap();
        assert!(resp.summary_text.starts_with("Summary:"));
        assert!(resp.tokens_before > 0);
    }

    #[tokio::test]
    async fn test_failing_summarizer_returns_failure() {
        let s = FailingSummarizer {
            failure: SummarizerFailure::timeout("too slow"),
        };
        let result = s
            .summarize(SummarizeRequest {
                input: SummarizeInput::Messages(vec![]),
                target_tokens: 10,
                custom_instructions: None,
                timeout_ms: 1,
            })
            .await;
        assert_eq!(result.unwrap_err().kind, SummarizerFailureKind::Timeout);
    }
}
