//! Optimistic mutation types.

use crate::types::{AuthorId, PostId, Version};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use thiserror::Error;

/// Identifier of a locally issued mutation; increases in submission order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MutationId(pub u64);

impl fmt::Debug for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MutationId({})", self.0)
    }
}

impl fmt::Display for MutationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a mutation changes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum MutationTarget {
    Post(PostId),
    Author(AuthorId),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationKind {
    Like,
    Unlike,
    CommentAdd,
    FollowToggle,
}

impl MutationKind {
    /// Kinds that coalesce with an opposite staged mutation on the same target.
    pub fn is_toggle(self) -> bool {
        !matches!(self, MutationKind::CommentAdd)
    }
}

/// The locally displayed value the mutation asserts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalValue {
    Liked(bool),
    Comment { temp_id: String, text: String },
    Following(bool),
}

/// Why a mutation was rolled back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RevertReason {
    Rejected(String),
    TransportExhausted(String),
    TimedOut,
    Conflict(String),
    /// Cancelled by an opposite toggle before it was ever submitted.
    Cancelled,
}

/// Lifecycle of one mutation.
///
/// `Staged -> InFlight -> Acknowledged -> Confirmed`, with `Reverted`
/// reachable from any non-terminal state. A transport failure sends an
/// in-flight mutation back to `Staged` until retries run out.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MutationState {
    /// Applied locally, not yet on the wire.
    Staged,
    /// Submitted, waiting for the receipt.
    InFlight,
    /// Server accepted it at this version; waiting for the authoritative event.
    Acknowledged(Version),
    Confirmed,
    Reverted(RevertReason),
}

/// A locally applied, not yet confirmed change.
#[derive(Clone, Debug)]
pub struct PendingMutation {
    pub id: MutationId,
    pub target: MutationTarget,
    pub kind: MutationKind,
    pub local_value: LocalValue,
    /// When the user issued it; the timeout runs from here.
    pub submitted_at: Instant,
    /// Transport failures so far.
    pub retry_count: u32,
    pub state: MutationState,
    /// Earliest time the next submission attempt may run.
    pub(crate) next_attempt_at: Option<Instant>,
    pub(crate) submission: Submission,
}

impl PendingMutation {
    /// Wire payload for this mutation.
    pub fn submission(&self) -> &Submission {
        &self.submission
    }

    pub fn post_id(&self) -> Option<&PostId> {
        match &self.target {
            MutationTarget::Post(post) => Some(post),
            MutationTarget::Author(_) => None,
        }
    }
}

/// What goes over the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Submission {
    Like { post: PostId },
    Unlike { post: PostId },
    Comment { post: PostId, client_id: String, text: String },
    Follow { author: AuthorId, follow: bool },
}

/// Successful submission result.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    /// Version of the target after the server applied the change.
    pub version: Version,
    /// Server id of a created record (comments).
    #[serde(default)]
    pub assigned_id: Option<String>,
}

impl Receipt {
    pub fn at(version: u64) -> Self {
        Self {
            version: Version(version),
            assigned_id: None,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.assigned_id = Some(id.into());
        self
    }
}

/// Submission failure.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// Network or backend hiccup; worth retrying.
    #[error("transport: {0}")]
    Transport(String),
    /// The server refused the change.
    #[error("{0}")]
    Rejected(String),
}

/// Backend endpoint for likes, comments and follows.
pub trait MutationSubmitter: Send + Sync {
    fn submit(&self, submission: &Submission) -> Result<Receipt, SubmitError>;
}
