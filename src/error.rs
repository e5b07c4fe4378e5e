//! Error types for the sync core.

use crate::changefeed::ScopeKey;
use thiserror::Error;

/// Main error type for sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Channel open/close, page fetch or submission failure.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Subscription failed for {scope}: {reason}")]
    SubscribeFailed { scope: ScopeKey, reason: String },

    #[error("Invalid scope key: {0}")]
    InvalidScopeKey(String),

    #[error("Rejected by moderation: {0}")]
    ModerationRejected(String),

    #[error("Post not tracked: {0}")]
    PostNotTracked(String),

    #[error("Empty comment")]
    EmptyComment,

    #[error("Caption generation failed: {0}")]
    Generation(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Decode(e.to_string())
    }
}

/// Result type for sync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
