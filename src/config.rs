// config.rs
// Recognized LCM engine configuration (spec §6.4)

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration accepted by [`crate::engine::LcmEngine::new`].
///
/// Every field has a default matching the spec's stated defaults, and the
/// struct derives `Deserialize` with `#[serde(default)]` per-field so a host
/// can hand in a partial JSON/TOML fragment without needing the generic
/// configuration-loader collaborator (out of scope for this crate).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcmConfig {
    /// Turns the engine on/off at the facade. When `false`, `LcmEngine`
    /// methods are no-ops that pass through the caller's input unchanged.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Storage file path, conventionally `<state_dir>/lcm/lcm.sqlite`.
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Overflow-compaction trigger, as a fraction of `model_token_budget`.
    #[serde(default = "default_context_threshold")]
    pub context_threshold: f64,

    /// Items never evicted by compaction or the assembler.
    #[serde(default = "default_fresh_tail_count")]
    pub fresh_tail_count: usize,

    /// Leaf summarizer token target.
    #[serde(default = "default_leaf_target_tokens")]
    pub leaf_target_tokens: usize,

    /// Condensed summarizer token target.
    #[serde(default = "default_condensed_target_tokens")]
    pub condensed_target_tokens: usize,

    /// Adjacent active message-type items grouped into one leaf summary call.
    #[serde(default = "default_leaf_batch_size")]
    pub leaf_batch_size: usize,

    /// Adjacent leaf summaries grouped into one condensed summary call.
    #[serde(default = "default_condensed_batch_size")]
    pub condensed_batch_size: usize,

    /// Ceiling applied to retrieval `tokenCap` inputs.
    #[serde(default = "default_max_expand_tokens")]
    pub max_expand_tokens: usize,

    /// Suppresses host auto-compaction when this engine is active.
    #[serde(default)]
    pub autocompact_disabled: bool,

    /// Model's total context window, used with `context_threshold` to derive
    /// the overflow trigger token count.
    #[serde(default = "default_model_token_budget")]
    pub model_token_budget: usize,

    /// Maximum passes a single `compact()` call may run before returning.
    #[serde(default = "default_max_compaction_passes")]
    pub max_compaction_passes: usize,
}

fn default_enabled() -> bool {
    true
}
fn default_database_path() -> PathBuf {
    PathBuf::from("lcm/lcm.sqlite")
}
fn default_context_threshold() -> f64 {
    0.75
}
fn default_fresh_tail_count() -> usize {
    8
}
fn default_leaf_target_tokens() -> usize {
    1_200
}
fn default_condensed_target_tokens() -> usize {
    900
}
fn default_leaf_batch_size() -> usize {
    6
}
fn default_condensed_batch_size() -> usize {
    3
}
fn default_max_expand_tokens() -> usize {
    20_000
}
fn default_model_token_budget() -> usize {
    128_000
}
fn default_max_compaction_passes() -> usize {
    4
}

impl Default for LcmConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            database_path: default_database_path(),
            context_threshold: default_context_threshold(),
            fresh_tail_count: default_fresh_tail_count(),
            leaf_target_tokens: default_leaf_target_tokens(),
            condensed_target_tokens: default_condensed_target_tokens(),
            leaf_batch_size: default_leaf_batch_size(),
            condensed_batch_size: default_condensed_batch_size(),
            max_expand_tokens: default_max_expand_tokens(),
            autocompact_disabled: false,
            model_token_budget: default_model_token_budget(),
            max_compaction_passes: default_max_compaction_passes(),
        }
    }
}

impl LcmConfig {
    /// The token count at which `ingest`/overflow checks trigger compaction.
    pub fn overflow_token_trigger(&self) -> usize {
        ((self.model_token_budget as f64) * self.context_threshold).floor() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_matches_spec_defaults() {
        let cfg = LcmConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.context_threshold, 0.75);
        assert_eq!(cfg.fresh_tail_count, 8);
        assert_eq!(cfg.leaf_batch_size, 6);
        assert_eq!(cfg.condensed_batch_size, 3);
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let cfg: LcmConfig = serde_json::from_str(r#"{"fresh_tail_count": 4}"#).unwrap();
        assert_eq!(cfg.fresh_tail_count, 4);
        assert_eq!(cfg.context_threshold, 0.75);
    }

    #[test]
    fn test_overflow_token_trigger() {
        let cfg = LcmConfig {
            model_token_budget: 1000,
            context_threshold: 0.8,
            ..Default::default()
        };
        assert_eq!(cfg.overflow_token_trigger(), 800);
    }
}
