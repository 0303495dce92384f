// retrieval/auth.rs
// Expansion Auth Registry (spec §4.6): an in-memory, lock-guarded set of
// time-bounded capability grants gating the retrieval engine's read-only
// reach into another session's conversation history.
//
// Grounded on the teacher's in-process capability map pattern
// (`background/capabilities.rs`-style guarded registries) generalized from a
// single process-wide table to explicit grant objects with TTL and
// revocation-by-session.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::{AuthFailureCode, LcmError, Result};
use crate::model::ExpansionGrant;
use crate::store::new_uuid;

const DEFAULT_GRANT_TTL_MS: i64 = 5 * 60 * 1000;

/// Parameters accepted by [`ExpansionAuthRegistry::issue_grant`].
#[derive(Debug, Clone)]
pub struct IssueGrantParams {
    pub delegator_session_key: String,
    pub delegate_session_key: String,
    pub allowed_conversation_ids: std::collections::HashSet<String>,
    pub allowed_summary_ids: std::collections::HashSet<String>,
    pub max_depth: u32,
    pub max_token_cap: usize,
    pub ttl_ms: Option<i64>,
    pub now_ms: i64,
}

/// A retrieval call's requested scope, checked against a grant by
/// [`ExpansionAuthRegistry::authorize`].
#[derive(Debug, Clone, Default)]
pub struct AuthorizeParams {
    pub session_key: String,
    pub conversation_id: Option<String>,
    /// The specific summary/file id the call targets (`describe`'s `id`,
    /// `expand`'s `summaryId`), checked against `grant.allowed_summary_ids`
    /// when that set is non-empty (spec §3: "empty = any").
    pub summary_id: Option<String>,
    pub depth: Option<u32>,
    pub token_cap: Option<usize>,
    pub now_ms: i64,
}

/// In-memory registry of [`ExpansionGrant`]s. A single `Mutex`-guarded map is
/// sufficient per spec §9 ("a single lock-protected map is sufficient").
pub struct ExpansionAuthRegistry {
    grants: Mutex<HashMap<String, ExpansionGrant>>,
    by_delegate: Mutex<HashMap<String, Vec<String>>>,
}

impl Default for ExpansionAuthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpansionAuthRegistry {
    pub fn new() -> Self {
        Self {
            grants: Mutex::new(HashMap::new()),
            by_delegate: Mutex::new(HashMap::new()),
        }
    }

    pub fn issue_grant(&self, params: IssueGrantParams) -> ExpansionGrant {
        let grant = ExpansionGrant {
            grant_id: new_uuid(),
            delegator_session_key: params.delegator_session_key,
            delegate_session_key: params.delegate_session_key.clone(),
            allowed_conversation_ids: params.allowed_conversation_ids,
            allowed_summary_ids: params.allowed_summary_ids,
            max_depth: params.max_depth,
            max_token_cap: params.max_token_cap,
            issued_at_ms: params.now_ms,
            expires_at_ms: params.now_ms + params.ttl_ms.unwrap_or(DEFAULT_GRANT_TTL_MS),
            revoked: false,
        };

        let mut grants = self.grants.lock().expect("grants mutex poisoned");
        grants.insert(grant.grant_id.clone(), grant.clone());
        drop(grants);

        let mut by_delegate = self.by_delegate.lock().expect("by_delegate mutex poisoned");
        by_delegate
            .entry(params.delegate_session_key)
            .or_default()
            .push(grant.grant_id.clone());

        grant
    }

    /// Resolves the grant bound to `params.session_key` and validates it
    /// against the requested scope, returning the specific sub-code on
    /// failure (spec §4.5's authorization contract).
    pub fn authorize(&self, params: &AuthorizeParams) -> Result<ExpansionGrant> {
        let grants = self.grants.lock().expect("grants mutex poisoned");
        let by_delegate = self.by_delegate.lock().expect("by_delegate mutex poisoned");

        let grant_ids = by_delegate.get(&params.session_key);
        let grant = grant_ids
            .and_then(|ids| {
                ids.iter()
                    .filter_map(|id| grants.get(id))
                    .max_by_key(|g| g.issued_at_ms)
            })
            .cloned();

        let Some(grant) = grant else {
            return Err(LcmError::AuthorizationFailed(AuthFailureCode::Missing));
        };

        if grant.revoked {
            return Err(LcmError::AuthorizationFailed(AuthFailureCode::Revoked));
        }
        if params.now_ms >= grant.expires_at_ms {
            return Err(LcmError::AuthorizationFailed(AuthFailureCode::Expired));
        }
        if params.conversation_id.is_none() && params.summary_id.is_none() {
            // Scope must be explicit: a call that names neither a
            // conversation nor a specific summary/file id gives the
            // registry nothing to check against.
            return Err(LcmError::AuthorizationFailed(AuthFailureCode::OutOfScope));
        }
        if let Some(conversation_id) = &params.conversation_id {
            if !grant.allowed_conversation_ids.contains(conversation_id) {
                return Err(LcmError::AuthorizationFailed(AuthFailureCode::OutOfScope));
            }
        }
        if let Some(summary_id) = &params.summary_id {
            if !grant.allowed_summary_ids.is_empty() && !grant.allowed_summary_ids.contains(summary_id) {
                return Err(LcmError::AuthorizationFailed(AuthFailureCode::OutOfScope));
            }
        }
        if let Some(depth) = params.depth {
            if depth > grant.max_depth {
                return Err(LcmError::AuthorizationFailed(AuthFailureCode::DepthExceeded));
            }
        }
        if let Some(token_cap) = params.token_cap {
            if token_cap > grant.max_token_cap {
                return Err(LcmError::AuthorizationFailed(AuthFailureCode::TokenCapExceeded));
            }
        }

        Ok(grant)
    }

    /// Flips `revoked` on the named grant. Returns `false` if the grant id is
    /// unknown (idempotent from the caller's point of view).
    pub fn revoke(&self, grant_id: &str) -> bool {
        let mut grants = self.grants.lock().expect("grants mutex poisoned");
        match grants.get_mut(grant_id) {
            Some(grant) => {
                grant.revoked = true;
                true
            }
            None => false,
        }
    }

    /// Removes expired or revoked grants. Returns the count removed.
    pub fn cleanup(&self, now_ms: i64) -> usize {
        let mut grants = self.grants.lock().expect("grants mutex poisoned");
        let doomed: Vec<String> = grants
            .values()
            .filter(|g| g.revoked || now_ms >= g.expires_at_ms)
            .map(|g| g.grant_id.clone())
            .collect();
        for id in &doomed {
            grants.remove(id);
        }
        drop(grants);

        let mut by_delegate = self.by_delegate.lock().expect("by_delegate mutex poisoned");
        for ids in by_delegate.values_mut() {
            ids.retain(|id| !doomed.contains(id));
        }
        by_delegate.retain(|_, ids| !ids.is_empty());

        doomed.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(conv: &str, now_ms: i64) -> IssueGrantParams {
        IssueGrantParams {
            delegator_session_key: "owner".into(),
            delegate_session_key: "delegate".into(),
            allowed_conversation_ids: [conv.to_string()].into_iter().collect(),
            allowed_summary_ids: Default::default(),
            max_depth: 2,
            max_token_cap: 4000,
            ttl_ms: None,
            now_ms,
        }
    }

    #[test]
    fn test_authorize_succeeds_within_scope() {
        let registry = ExpansionAuthRegistry::new();
        registry.issue_grant(params("convA", 0));
        let grant = registry
            .authorize(&AuthorizeParams {
                session_key: "delegate".into(),
                conversation_id: Some("convA".into()),
                summary_id: None,
                depth: Some(1),
                token_cap: Some(100),
                now_ms: 10,
            })
            .unwrap();
        assert_eq!(grant.delegate_session_key, "delegate");
    }

    #[test]
    fn test_authorize_rejects_out_of_scope_conversation() {
        let registry = ExpansionAuthRegistry::new();
        registry.issue_grant(params("convA", 0));
        let err = registry
            .authorize(&AuthorizeParams {
                session_key: "delegate".into(),
                conversation_id: Some("convB".into()),
                summary_id: None,
                depth: None,
                token_cap: None,
                now_ms: 10,
            })
            .unwrap_err();
        assert_eq!(err.to_string(), LcmError::AuthorizationFailed(AuthFailureCode::OutOfScope).to_string());
    }

    #[test]
    fn test_authorize_rejects_depth_exceeded() {
        let registry = ExpansionAuthRegistry::new();
        registry.issue_grant(params("convA", 0));
        let err = registry
            .authorize(&AuthorizeParams {
                session_key: "delegate".into(),
                conversation_id: Some("convA".into()),
                summary_id: None,
                depth: Some(99),
                token_cap: None,
                now_ms: 10,
            })
            .unwrap_err();
        assert!(matches!(err, LcmError::AuthorizationFailed(AuthFailureCode::DepthExceeded)));
    }

    #[test]
    fn test_authorize_rejects_expired_grant() {
        let registry = ExpansionAuthRegistry::new();
        registry.issue_grant(IssueGrantParams {
            ttl_ms: Some(100),
            ..params("convA", 0)
        });
        let err = registry
            .authorize(&AuthorizeParams {
                session_key: "delegate".into(),
                conversation_id: Some("convA".into()),
                summary_id: None,
                depth: None,
                token_cap: None,
                now_ms: 1000,
            })
            .unwrap_err();
        assert!(matches!(err, LcmError::AuthorizationFailed(AuthFailureCode::Expired)));
    }

    #[test]
    fn test_revoke_by_grant_id() {
        let registry = ExpansionAuthRegistry::new();
        let grant = registry.issue_grant(params("convA", 0));
        assert!(registry.revoke(&grant.grant_id));
        let err = registry
            .authorize(&AuthorizeParams {
                session_key: "delegate".into(),
                conversation_id: Some("convA".into()),
                summary_id: None,
                depth: None,
                token_cap: None,
                now_ms: 1,
            })
            .unwrap_err();
        assert!(matches!(err, LcmError::AuthorizationFailed(AuthFailureCode::Revoked)));
    }

    #[test]
    fn test_authorize_enforces_allowed_summary_ids_when_non_empty() {
        let registry = ExpansionAuthRegistry::new();
        registry.issue_grant(IssueGrantParams {
            allowed_summary_ids: ["sum-1".to_string()].into_iter().collect(),
            ..params("convA", 0)
        });

        let ok = registry.authorize(&AuthorizeParams {
            session_key: "delegate".into(),
            conversation_id: Some("convA".into()),
            summary_id: Some("sum-1".into()),
            depth: None,
            token_cap: None,
            now_ms: 10,
        });
        assert!(ok.is_ok());

        let err = registry
            .authorize(&AuthorizeParams {
                session_key: "delegate".into(),
                conversation_id: Some("convA".into()),
                summary_id: Some("sum-2".into()),
                depth: None,
                token_cap: None,
                now_ms: 10,
            })
            .unwrap_err();
        assert!(matches!(err, LcmError::AuthorizationFailed(AuthFailureCode::OutOfScope)));
    }

    #[test]
    fn test_authorize_allows_any_summary_id_when_allowed_summary_ids_empty() {
        let registry = ExpansionAuthRegistry::new();
        registry.issue_grant(params("convA", 0));
        let ok = registry.authorize(&AuthorizeParams {
            session_key: "delegate".into(),
            conversation_id: Some("convA".into()),
            summary_id: Some("anything".into()),
            depth: None,
            token_cap: None,
            now_ms: 10,
        });
        assert!(ok.is_ok());
    }

    #[test]
    fn test_cleanup_removes_expired_and_revoked() {
        let registry = ExpansionAuthRegistry::new();
        registry.issue_grant(IssueGrantParams { ttl_ms: Some(10), ..params("convA", 0) });
        let still_good = registry.issue_grant(params("convB", 0));
        registry.issue_grant(params("convC", 0));
        registry.revoke(&still_good.grant_id);

        let removed = registry.cleanup(1000);
        assert_eq!(removed, 2);
    }
}
