//! Sync engine errors.

use thiserror::Error;

use crate::providers::mail::RemoteError;
use crate::storage::DatabaseError;

/// Errors that end a sync pass.
///
/// Per-message fetch failures never surface here; they are reported in the
/// pass report and handed to the failure tracker.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("storage error: {0}")]
    Storage(#[from] DatabaseError),

    #[error("history cursor expired")]
    CursorExpired,

    #[error("sync cancelled")]
    Cancelled,

    #[error("account not initialized, run an initial sync first")]
    AccountNotInitialized,

    #[error("commit failed after {attempts} attempts: {source}")]
    CommitFailed {
        attempts: u32,
        #[source]
        source: DatabaseError,
    },
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Short text for the progress channel.
    pub fn status_text(&self) -> String {
        match self {
            Self::Remote(RemoteError::Authentication(_)) => "Sign-in required".to_string(),
            Self::Remote(e) if e.is_retryable() => "Mail server unavailable".to_string(),
            Self::Remote(_) => "Mail server error".to_string(),
            Self::Storage(_) | Self::CommitFailed { .. } => "Could not save mail".to_string(),
            Self::CursorExpired => "Resynchronizing".to_string(),
            Self::Cancelled => "Cancelled".to_string(),
            Self::AccountNotInitialized => "Account not set up".to_string(),
        }
    }
}
