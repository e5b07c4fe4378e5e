//! Content moderation contract.
//!
//! Policy lives outside this crate; the sync core only honors the verdict.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "snake_case")]
pub enum ModerationVerdict {
    Allow,
    /// Publish, but the content was flagged for review.
    Flag,
    /// Do not publish.
    Reject(String),
}

/// Reviews user-authored text before it is applied or published.
pub trait ModerationGate: Send + Sync {
    fn review(&self, text: &str) -> ModerationVerdict;
}

/// Gate that lets everything through.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl ModerationGate for AllowAll {
    fn review(&self, _text: &str) -> ModerationVerdict {
        ModerationVerdict::Allow
    }
}
