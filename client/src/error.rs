//! Unified error handling for the session layer.

use crate::remote::RemoteError;
use std::time::Duration;
use tandem_engine::ScopeKey;

/// Errors surfaced to the UI layer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Validation error: {0}")]
    Validation(#[from] tandem_engine::Error),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Rejected by remote store: {0}")]
    Rejected(String),

    #[error("Scope {0} is not active")]
    NotActive(ScopeKey),

    #[error("Superseded by a scope switch")]
    Superseded,
}

impl SyncError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Transport(_) | SyncError::Timeout { .. })
    }
}

impl From<RemoteError> for SyncError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Transport(msg) => SyncError::Transport(msg),
            // Absorbable conflicts never get here; what is left is a refusal.
            RemoteError::Conflict { message, .. } => {
                SyncError::Rejected(format!("conflict: {message}"))
            }
            RemoteError::Rejected(msg) => SyncError::Rejected(msg),
            RemoteError::NotFound(id) => SyncError::Rejected(format!("entity not found: {id}")),
        }
    }
}

/// Result type alias for session operations.
pub type Result<T> = std::result::Result<T, SyncError>;
