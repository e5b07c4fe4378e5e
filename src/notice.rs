//! User-facing outcome notices.

use crate::changefeed::ScopeKey;
use crate::mutations::{MutationId, MutationKind};
use std::fmt;

/// One-line outcome the UI may surface.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    /// The server refused a mutation; its optimistic change was undone.
    MutationRejected {
        mutation: MutationId,
        kind: MutationKind,
        reason: String,
    },
    /// Submission kept failing at the transport level.
    MutationFailed {
        mutation: MutationId,
        kind: MutationKind,
        reason: String,
    },
    MutationTimedOut {
        mutation: MutationId,
        kind: MutationKind,
    },
    /// Authoritative data contradicted a pending mutation.
    MutationConflict {
        mutation: MutationId,
        kind: MutationKind,
        reason: String,
    },
    ModerationRejected { reason: String },
    /// A local comment now has its server id.
    CommentConfirmed { temp_id: String, server_id: String },
    ScopeDegraded { scope: ScopeKey },
    ScopeRecovered { scope: ScopeKey },
}

impl Notice {
    pub fn message(&self) -> String {
        match self {
            Notice::MutationRejected { kind, reason, .. } => {
                format!("{} was rejected: {}", describe(*kind), reason)
            }
            Notice::MutationFailed { kind, reason, .. } => {
                format!("{} could not be sent: {}", describe(*kind), reason)
            }
            Notice::MutationTimedOut { kind, .. } => {
                format!("{} was not confirmed in time and was undone", describe(*kind))
            }
            Notice::MutationConflict { kind, reason, .. } => {
                format!("{} was undone: {}", describe(*kind), reason)
            }
            Notice::ModerationRejected { reason } => {
                format!("Content was not published: {}", reason)
            }
            Notice::CommentConfirmed { .. } => "Comment posted".to_string(),
            Notice::ScopeDegraded { scope } => {
                format!("Live updates unavailable for {}", scope)
            }
            Notice::ScopeRecovered { scope } => format!("Live updates restored for {}", scope),
        }
    }

    /// The mutation this notice reports on, if any.
    pub fn mutation(&self) -> Option<MutationId> {
        match self {
            Notice::MutationRejected { mutation, .. }
            | Notice::MutationFailed { mutation, .. }
            | Notice::MutationTimedOut { mutation, .. }
            | Notice::MutationConflict { mutation, .. } => Some(*mutation),
            _ => None,
        }
    }
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

fn describe(kind: MutationKind) -> &'static str {
    match kind {
        MutationKind::Like => "Like",
        MutationKind::Unlike => "Unlike",
        MutationKind::CommentAdd => "Comment",
        MutationKind::FollowToggle => "Follow change",
    }
}
