// error.rs
// Standardized error types for the LCM engine

use thiserror::Error;

/// Sub-code carried by [`LcmError::AuthorizationFailed`], matching the
/// Expansion Auth Registry's failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailureCode {
    Missing,
    Expired,
    Revoked,
    OutOfScope,
    DepthExceeded,
    TokenCapExceeded,
}

impl std::fmt::Display for AuthFailureCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AuthFailureCode::Missing => "missing",
            AuthFailureCode::Expired => "expired",
            AuthFailureCode::Revoked => "revoked",
            AuthFailureCode::OutOfScope => "out_of_scope",
            AuthFailureCode::DepthExceeded => "depth_exceeded",
            AuthFailureCode::TokenCapExceeded => "token_cap_exceeded",
        };
        f.write_str(s)
    }
}

/// Main error type for the LCM engine.
#[derive(Error, Debug)]
pub enum LcmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("storage busy: retries exhausted")]
    StorageBusy,

    #[error("integrity violation: {0}")]
    Integrity(String),

    #[error("expansion authorization failed: {0}")]
    AuthorizationFailed(AuthFailureCode),

    #[error("summarizer failed: {0}")]
    SummarizerFailed(String),

    #[error("summarizer timed out")]
    SummarizerTimeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, LcmError>;

impl LcmError {
    /// Short, user-facing reason string — used as `compact()`'s `reason` field
    /// and similar boundary-facing surfaces.
    pub fn to_user_string(&self) -> String {
        self.to_string()
    }
}

impl From<String> for LcmError {
    fn from(s: String) -> Self {
        LcmError::Other(s)
    }
}

impl From<tokio::task::JoinError> for LcmError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            LcmError::Cancelled
        } else {
            LcmError::Other(err.to_string())
        }
    }
}

impl From<LcmError> for String {
    fn from(err: LcmError) -> Self {
        err.to_string()
    }
}
