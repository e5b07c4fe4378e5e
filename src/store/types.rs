//! Feed store bookkeeping types.

use crate::changefeed::ScopeKey;
use crate::mutations::MutationId;
use crate::types::{Post, Version};

/// Where a record first came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Origin {
    /// Historical page fetch.
    Page,
    /// Live insert from a change feed.
    Live,
}

/// Outcome of matching a pending mutation against authoritative data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// The authoritative state now reflects the mutation.
    Confirmed {
        mutation: MutationId,
        /// Server id of the created record, for comments.
        assigned_id: Option<String>,
    },
    /// The authoritative state contradicts the mutation; its layer is gone.
    Conflict { mutation: MutationId, reason: String },
}

impl Resolution {
    pub fn mutation(&self) -> MutationId {
        match self {
            Resolution::Confirmed { mutation, .. } | Resolution::Conflict { mutation, .. } => {
                *mutation
            }
        }
    }
}

/// What applying one change event did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    /// False when the event was a duplicate, stale or untracked.
    pub applied: bool,
    /// Scopes that will never deliver again and should be closed now.
    pub closed_scopes: Vec<ScopeKey>,
    pub resolutions: Vec<Resolution>,
}

/// Result of merging a page of posts.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PageMerge {
    pub added: usize,
    /// Already present (live copy kept) or not displayable.
    pub skipped: usize,
}

/// Effect of one optimistic layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Effect {
    Reaction { liked: bool },
    Comment,
}

#[derive(Clone, Debug)]
pub(crate) struct Layer {
    pub mutation: MutationId,
    pub effect: Effect,
    /// Receipt version, once the server accepted the mutation.
    pub acknowledged: Option<Version>,
    /// Server id from the receipt, for comments.
    pub assigned_id: Option<String>,
}

#[derive(Clone, Debug)]
pub(crate) struct FollowLayer {
    pub mutation: MutationId,
    pub follow: bool,
}

/// Dedup state of a comment or reaction id.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChildState {
    Present,
    Removed,
}

/// Why a post left the store through a change feed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Tombstone {
    Deleted,
    /// Hidden or soft-deleted as of this version; a newer copy may come back.
    Hidden(Version),
}

impl Tombstone {
    /// Whether a copy of the post at `version` must stay out.
    pub fn suppresses(&self, version: Version) -> bool {
        match self {
            Tombstone::Deleted => true,
            Tombstone::Hidden(at) => version <= *at,
        }
    }
}

/// One post in the store.
#[derive(Clone, Debug)]
pub(crate) struct PostEntry {
    /// Authoritative record.
    pub base: Post,
    pub origin: Origin,
    /// Set once any change feed event touched this post.
    pub live_touched: bool,
    /// Optimistic layers in submission order.
    pub layers: Vec<Layer>,
}

impl PostEntry {
    pub fn new(post: Post, origin: Origin) -> Self {
        Self {
            live_touched: origin == Origin::Live,
            base: post,
            origin,
            layers: Vec::new(),
        }
    }

    /// The post as displayed: base with every layer applied.
    pub fn view(&self) -> Post {
        let mut post = self.base.clone();
        for layer in &self.layers {
            match layer.effect {
                Effect::Reaction { liked } => {
                    if liked != post.liked_by_me {
                        post.reaction_count = if liked {
                            post.reaction_count + 1
                        } else {
                            post.reaction_count.saturating_sub(1)
                        };
                        post.liked_by_me = liked;
                    }
                }
                Effect::Comment => post.comment_count += 1,
            }
        }
        post
    }

    pub fn first_reaction_layer(&self) -> Option<usize> {
        self.layers
            .iter()
            .position(|l| matches!(l.effect, Effect::Reaction { .. }))
    }

    /// The comment layer an own comment insert confirms: the one whose
    /// receipt named this id, else the oldest one still without an id.
    pub fn take_comment_layer(&mut self, server_id: &str) -> Option<Layer> {
        let index = self
            .layers
            .iter()
            .position(|l| l.effect == Effect::Comment && l.assigned_id.as_deref() == Some(server_id))
            .or_else(|| {
                self.layers
                    .iter()
                    .position(|l| l.effect == Effect::Comment && l.assigned_id.is_none())
            })?;
        Some(self.layers.remove(index))
    }
}
