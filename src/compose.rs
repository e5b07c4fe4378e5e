//! Post composition: caption generation, moderation and publishing.

use crate::error::{Result, SyncError};
use crate::moderation::{ModerationGate, ModerationVerdict};
use crate::types::{AuthorId, Post};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// A post the viewer is about to publish.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostDraft {
    pub author_id: AuthorId,
    pub caption: String,
    /// Uploaded media reference.
    pub media: Option<String>,
}

impl PostDraft {
    pub fn new(author_id: impl Into<String>, caption: impl Into<String>) -> Self {
        Self {
            author_id: AuthorId::new(author_id),
            caption: caption.into(),
            media: None,
        }
    }

    pub fn with_media(mut self, media: impl Into<String>) -> Self {
        self.media = Some(media.into());
        self
    }
}

/// Writes a caption for media when the author left it empty.
pub trait CaptionGenerator: Send + Sync {
    fn generate(&self, media: &str) -> std::result::Result<String, String>;
}

/// Backend endpoint that creates posts.
pub trait PostPublisher: Send + Sync {
    /// Returns the created post as the server stored it.
    fn publish(&self, draft: &PostDraft) -> std::result::Result<Post, String>;
}

/// Fill in a missing caption and run moderation.
///
/// Returns the draft ready to publish, or why it must not be published.
pub fn prepare_draft(
    mut draft: PostDraft,
    generator: Option<&dyn CaptionGenerator>,
    gate: &dyn ModerationGate,
) -> Result<PostDraft> {
    draft.caption = draft.caption.trim().to_string();

    if draft.caption.is_empty() {
        match (generator, draft.media.as_deref()) {
            (Some(generator), Some(media)) => {
                let caption = generator.generate(media).map_err(SyncError::Generation)?;
                info!(media, "caption generated");
                draft.caption = caption.trim().to_string();
            }
            (_, None) => {
                return Err(SyncError::InvalidOperation(
                    "post needs a caption or media".to_string(),
                ))
            }
            (None, Some(_)) => {}
        }
    }

    match gate.review(&draft.caption) {
        ModerationVerdict::Allow => Ok(draft),
        ModerationVerdict::Flag => {
            warn!(author = %draft.author_id, "post flagged by moderation");
            Ok(draft)
        }
        ModerationVerdict::Reject(reason) => Err(SyncError::ModerationRejected(reason)),
    }
}
