//! Change feed event types.

use crate::error::{Result, SyncError};
use crate::types::{AuthorId, Post, PostId};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which kind of entity a record describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Post,
    Comment,
    Reaction,
}

/// Identifier used to subscribe to changes for a set of entities.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ScopeKey {
    /// All posts written by one author.
    PostsByAuthor(AuthorId),
    /// All comments on one post.
    CommentsOnPost(PostId),
    /// All reactions on one post.
    ReactionsOnPost(PostId),
}

impl ScopeKey {
    /// Kind of entity the scope delivers.
    pub fn entity_kind(&self) -> EntityKind {
        match self {
            ScopeKey::PostsByAuthor(_) => EntityKind::Post,
            ScopeKey::CommentsOnPost(_) => EntityKind::Comment,
            ScopeKey::ReactionsOnPost(_) => EntityKind::Reaction,
        }
    }

    /// Scopes that only exist because of this post.
    pub fn child_scopes(post: &PostId) -> [ScopeKey; 2] {
        [
            ScopeKey::CommentsOnPost(post.clone()),
            ScopeKey::ReactionsOnPost(post.clone()),
        ]
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::PostsByAuthor(id) => write!(f, "posts-by-author:{}", id),
            ScopeKey::CommentsOnPost(id) => write!(f, "comments-on-post:{}", id),
            ScopeKey::ReactionsOnPost(id) => write!(f, "reactions-on-post:{}", id),
        }
    }
}

impl fmt::Debug for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Scope({})", self)
    }
}

impl FromStr for ScopeKey {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, id) = s
            .split_once(':')
            .ok_or_else(|| SyncError::InvalidScopeKey(s.to_string()))?;
        if id.is_empty() {
            return Err(SyncError::InvalidScopeKey(s.to_string()));
        }
        match prefix {
            "posts-by-author" => Ok(ScopeKey::PostsByAuthor(AuthorId::new(id))),
            "comments-on-post" => Ok(ScopeKey::CommentsOnPost(PostId::new(id))),
            "reactions-on-post" => Ok(ScopeKey::ReactionsOnPost(PostId::new(id))),
            _ => Err(SyncError::InvalidScopeKey(s.to_string())),
        }
    }
}

/// Change operation carried by an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

/// A comment or reaction row; only the fields the feed needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildRecord {
    pub id: String,

    #[serde(alias = "publication_id")]
    pub post_id: PostId,

    #[serde(alias = "user_id")]
    pub actor_id: AuthorId,
}

impl ChildRecord {
    pub fn new(id: impl Into<String>, post_id: &PostId, actor_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            post_id: post_id.clone(),
            actor_id: AuthorId::new(actor_id),
        }
    }
}

/// The record carried by an event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EntityRecord {
    Post(Post),
    Comment(ChildRecord),
    Reaction(ChildRecord),
}

/// One change delivered on a change feed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChangeEvent {
    pub op: ChangeOp,
    /// Scope the event was delivered on.
    pub scope: ScopeKey,
    /// New row for inserts and updates; the removed row for deletes.
    pub record: EntityRecord,
    /// Row before the change, when the transport provides it.
    pub prior: Option<EntityRecord>,
}

impl ChangeEvent {
    pub fn new(op: ChangeOp, scope: ScopeKey, record: EntityRecord) -> Self {
        Self {
            op,
            scope,
            record,
            prior: None,
        }
    }

    /// Post event on its author's scope.
    pub fn post(op: ChangeOp, post: Post) -> Self {
        let scope = ScopeKey::PostsByAuthor(post.author_id.clone());
        Self::new(op, scope, EntityRecord::Post(post))
    }

    /// Comment event on its post's scope.
    pub fn comment(op: ChangeOp, comment: ChildRecord) -> Self {
        let scope = ScopeKey::CommentsOnPost(comment.post_id.clone());
        Self::new(op, scope, EntityRecord::Comment(comment))
    }

    /// Reaction event on its post's scope.
    pub fn reaction(op: ChangeOp, reaction: ChildRecord) -> Self {
        let scope = ScopeKey::ReactionsOnPost(reaction.post_id.clone());
        Self::new(op, scope, EntityRecord::Reaction(reaction))
    }
}

/// Wire envelope as sent by the realtime backend.
#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "eventType", alias = "event_type")]
    event_type: ChangeOp,
    #[serde(default)]
    record: Option<serde_json::Value>,
    #[serde(default, alias = "oldRecord")]
    old_record: Option<serde_json::Value>,
}

fn decode_record(kind: EntityKind, value: serde_json::Value) -> Result<EntityRecord> {
    Ok(match kind {
        EntityKind::Post => EntityRecord::Post(serde_json::from_value(value)?),
        EntityKind::Comment => EntityRecord::Comment(serde_json::from_value(value)?),
        EntityKind::Reaction => EntityRecord::Reaction(serde_json::from_value(value)?),
    })
}

/// Decode a JSON envelope received on `scope`.
///
/// Deletes may carry only `old_record`; it then becomes the event record.
pub fn decode_envelope(scope: &ScopeKey, json: &[u8]) -> Result<ChangeEvent> {
    let envelope: Envelope = serde_json::from_slice(json)?;
    let kind = scope.entity_kind();

    let record = envelope.record.filter(|v| !v.is_null());
    let prior = envelope.old_record.filter(|v| !v.is_null());

    let (record, prior) = match (record, prior) {
        (Some(record), prior) => (record, prior),
        (None, Some(prior)) if envelope.event_type == ChangeOp::Delete => (prior, None),
        _ => {
            return Err(SyncError::Decode(format!(
                "{:?} event on {} without a record",
                envelope.event_type, scope
            )))
        }
    };

    Ok(ChangeEvent {
        op: envelope.event_type,
        scope: scope.clone(),
        record: decode_record(kind, record)?,
        prior: prior.map(|p| decode_record(kind, p)).transpose()?,
    })
}

/// Messages delivered on a feed handle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeedMessage {
    /// The transport confirmed the subscription.
    Subscribed,
    /// A change on the subscribed scope.
    Change(ChangeEvent),
    /// The transport stopped delivering on this handle.
    Dropped { reason: DropReason },
}

/// Why a feed stopped delivering.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Send buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly closed by the consumer.
    Unsubscribed,
    /// Transport-side failure.
    Error(String),
}
