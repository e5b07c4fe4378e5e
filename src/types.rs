//! Core types for the feed synchronization core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                $name(id.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                $name(s.to_string())
            }
        }
    };
}

string_id!(
    /// Opaque, immutable post identifier.
    PostId
);

string_id!(
    /// Identifier of a user (post author, commenter, reactor, follow target).
    AuthorId
);

/// Server-assigned, per-record monotonically increasing version.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Version(pub u64);

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A post as delivered by the backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: PostId,

    /// Delete envelopes may carry only the id, so the remaining fields
    /// tolerate being absent.
    #[serde(default, alias = "user_id")]
    pub author_id: AuthorId,

    #[serde(default)]
    pub created_at: Timestamp,

    #[serde(default, alias = "content")]
    pub caption: String,

    /// Storage reference of the attached photo or video.
    #[serde(default, alias = "media_url")]
    pub media: Option<String>,

    #[serde(default)]
    pub version: Version,

    #[serde(default, alias = "comments_count")]
    pub comment_count: u64,

    #[serde(default, alias = "reactions_count")]
    pub reaction_count: u64,

    /// Whether the viewing user has reacted. Filled in by the page source;
    /// live updates do not carry it.
    #[serde(default)]
    pub liked_by_me: bool,

    /// Hidden by moderation.
    #[serde(default, alias = "est_masque")]
    pub hidden: bool,

    /// Soft-delete marker.
    #[serde(default)]
    pub deleted_at: Option<Timestamp>,
}

impl Post {
    /// Create a visible post with zeroed counters at version 1.
    pub fn new(
        id: impl Into<String>,
        author_id: impl Into<String>,
        created_at: Timestamp,
        caption: impl Into<String>,
    ) -> Self {
        Self {
            id: PostId::new(id),
            author_id: AuthorId::new(author_id),
            created_at,
            caption: caption.into(),
            media: None,
            version: Version(1),
            comment_count: 0,
            reaction_count: 0,
            liked_by_me: false,
            hidden: false,
            deleted_at: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Version(version);
        self
    }

    pub fn with_counts(mut self, comments: u64, reactions: u64) -> Self {
        self.comment_count = comments;
        self.reaction_count = reactions;
        self
    }

    pub fn with_media(mut self, media: impl Into<String>) -> Self {
        self.media = Some(media.into());
        self
    }

    /// Whether the post may be shown at all.
    pub fn is_displayable(&self) -> bool {
        !self.hidden && self.deleted_at.is_none()
    }

    /// Feed ordering key: newest first, ties broken by id.
    pub fn order_key(&self) -> (Timestamp, &PostId) {
        (self.created_at, &self.id)
    }
}

/// Rendered view of one feed entry: the authoritative post with every
/// pending optimistic layer applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeedItem {
    pub post: Post,
    /// Number of optimistic mutations still layered on this post.
    pub pending: usize,
    /// True when a change feed for this post is degraded and the data may
    /// be out of date.
    pub stale: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_deserializes_with_defaults() {
        let post: Post = serde_json::from_str(
            r#"{"id":"p1","author_id":"a1","created_at":42}"#,
        )
        .unwrap();

        assert_eq!(post.id, PostId::from("p1"));
        assert_eq!(post.version, Version(0));
        assert!(post.is_displayable());
        assert!(!post.liked_by_me);
    }

    #[test]
    fn test_hidden_or_deleted_not_displayable() {
        let mut post = Post::new("p1", "a1", Timestamp(1), "hi");
        post.hidden = true;
        assert!(!post.is_displayable());

        let mut post = Post::new("p2", "a1", Timestamp(1), "hi");
        post.deleted_at = Some(Timestamp(5));
        assert!(!post.is_displayable());
    }

    #[test]
    fn test_order_key_newest_first() {
        let old = Post::new("a", "x", Timestamp(10), "");
        let new = Post::new("b", "x", Timestamp(20), "");
        assert!(new.order_key() > old.order_key());
    }
}
