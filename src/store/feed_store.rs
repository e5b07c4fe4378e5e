//! The canonical, ordered post cache.

use super::types::{
    ApplyOutcome, ChildState, Effect, FollowLayer, Layer, Origin, PageMerge, PostEntry, Resolution,
    Tombstone,
};
use crate::changefeed::{ChangeEvent, ChangeOp, ChildRecord, EntityKind, EntityRecord, ScopeKey};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::mutations::{LocalValue, MutationId, MutationTarget, PendingMutation, Receipt};
use crate::types::{AuthorId, FeedItem, Post, PostId, Timestamp, Version};
use lru::LruCache;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::num::NonZeroUsize;
use tracing::debug;

/// Ordered, deduplicated cache of posts plus the viewer's optimistic layers.
///
/// Every producer (page merges, change events, optimistic mutations) goes
/// through `&mut self`; callers share it behind a single lock so writes are
/// serialized while readers take consistent snapshots.
pub struct FeedStore {
    viewer: AuthorId,

    entries: HashMap<PostId, PostEntry>,

    /// Post ids, newest first.
    order: Vec<PostId>,

    /// Recently seen comment and reaction ids.
    seen_children: LruCache<(EntityKind, String), ChildState>,

    /// Posts a change feed removed; page copies of them stay out.
    removed_posts: LruCache<PostId, Tombstone>,

    /// Like state of toggles that timed out, so their late echo is ignored.
    expired_toggles: LruCache<PostId, bool>,

    /// Authoritative follow state per author.
    following: HashMap<AuthorId, bool>,

    follow_layers: HashMap<AuthorId, Vec<FollowLayer>>,

    /// Which target each live layer sits on.
    layer_targets: HashMap<MutationId, MutationTarget>,

    /// No older history left to page in.
    history_exhausted: bool,

    /// Scopes currently without a working change feed.
    degraded: HashSet<ScopeKey>,
}

impl FeedStore {
    /// Create an empty store for `viewer`.
    pub fn new(viewer: AuthorId, child_dedup_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(child_dedup_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            viewer,
            entries: HashMap::new(),
            order: Vec::new(),
            seen_children: LruCache::new(capacity),
            removed_posts: LruCache::new(capacity),
            expired_toggles: LruCache::new(capacity),
            following: HashMap::new(),
            follow_layers: HashMap::new(),
            layer_targets: HashMap::new(),
            history_exhausted: false,
            degraded: HashSet::new(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.viewer_id.clone(), config.child_dedup_capacity)
    }

    pub fn viewer(&self) -> &AuthorId {
        &self.viewer
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn contains(&self, id: &PostId) -> bool {
        self.entries.contains_key(id)
    }

    /// Post ids in display order.
    pub fn ids(&self) -> Vec<PostId> {
        self.order.clone()
    }

    /// Displayed state of one post.
    pub fn get(&self, id: &PostId) -> Option<FeedItem> {
        self.entries.get(id).map(|entry| self.item(entry))
    }

    /// Displayed state of the whole feed, newest first.
    pub fn snapshot(&self) -> Vec<FeedItem> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|entry| self.item(entry))
            .collect()
    }

    fn item(&self, entry: &PostEntry) -> FeedItem {
        let id = &entry.base.id;
        let stale = self
            .degraded
            .contains(&ScopeKey::PostsByAuthor(entry.base.author_id.clone()))
            || ScopeKey::child_scopes(id)
                .iter()
                .any(|scope| self.degraded.contains(scope));
        FeedItem {
            post: entry.view(),
            pending: entry.layers.len(),
            stale,
        }
    }

    /// Origin of a post, if tracked.
    pub fn origin(&self, id: &PostId) -> Option<Origin> {
        self.entries.get(id).map(|e| e.origin)
    }

    /// Optimistic layers currently applied, across posts and follows.
    pub fn pending_layers(&self) -> usize {
        self.layer_targets.len()
    }

    pub fn history_exhausted(&self) -> bool {
        self.history_exhausted
    }

    pub fn set_history_exhausted(&mut self, exhausted: bool) {
        self.history_exhausted = exhausted;
    }

    /// Displayed follow state for an author.
    pub fn is_following(&self, author: &AuthorId) -> bool {
        self.follow_layers
            .get(author)
            .and_then(|layers| layers.last())
            .map(|layer| layer.follow)
            .unwrap_or_else(|| self.following.get(author).copied().unwrap_or(false))
    }

    /// Record the authoritative follow state (e.g. from a profile load).
    pub fn set_following(&mut self, author: AuthorId, follow: bool) {
        self.following.insert(author, follow);
    }

    /// Replace the set of degraded scopes.
    pub fn set_degraded(&mut self, scopes: impl IntoIterator<Item = ScopeKey>) {
        self.degraded = scopes.into_iter().collect();
    }

    /// Scope keys for the given posts, or for every post when `visible` is None.
    pub fn desired_scopes(&self, visible: Option<&[PostId]>) -> BTreeSet<ScopeKey> {
        let ids: Vec<&PostId> = match visible {
            Some(ids) => ids.iter().collect(),
            None => self.order.iter().collect(),
        };

        let mut scopes = BTreeSet::new();
        for id in ids {
            if let Some(entry) = self.entries.get(id) {
                scopes.insert(ScopeKey::PostsByAuthor(entry.base.author_id.clone()));
                scopes.extend(ScopeKey::child_scopes(id));
            }
        }
        scopes
    }

    // --- Page merges ---

    /// Load the first page of a fresh feed.
    ///
    /// Replaces an empty store; otherwise appends, skipping ids already present.
    pub fn seed(&mut self, batch: Vec<Post>) -> PageMerge {
        if self.order.is_empty() {
            self.entries.clear();
        }
        self.merge_page(batch)
    }

    /// Merge a page of historical posts. Ids already present keep their
    /// current copy, so re-merging the same page is a no-op. Posts a change
    /// feed already removed are skipped.
    pub fn merge_page(&mut self, batch: Vec<Post>) -> PageMerge {
        let mut merge = PageMerge::default();
        for post in batch {
            if self.entries.contains_key(&post.id)
                || !post.is_displayable()
                || self.is_removed(&post)
            {
                merge.skipped += 1;
                continue;
            }
            self.insert_sorted(post, Origin::Page);
            merge.added += 1;
        }
        merge
    }

    fn is_removed(&self, post: &Post) -> bool {
        self.removed_posts
            .peek(&post.id)
            .is_some_and(|tombstone| tombstone.suppresses(post.version))
    }

    fn insert_sorted(&mut self, post: Post, origin: Origin) {
        let entries = &self.entries;
        let position = self.order.partition_point(|id| {
            entries.get(id).map(|e| e.base.order_key()) > Some(post.order_key())
        });
        self.order.insert(position, post.id.clone());
        self.entries.insert(post.id.clone(), PostEntry::new(post, origin));
    }

    fn tail_key(&self) -> Option<(Timestamp, PostId)> {
        let id = self.order.last()?;
        self.entries
            .get(id)
            .map(|e| (e.base.created_at, e.base.id.clone()))
    }

    /// Drop historical entries past the first `retained` that no change feed
    /// has touched and that carry no pending mutation.
    pub fn refresh_evict(&mut self, retained: usize) -> Vec<PostId> {
        let evicted: Vec<PostId> = self
            .order
            .iter()
            .skip(retained)
            .filter(|id| {
                self.entries.get(*id).is_some_and(|e| {
                    e.origin == Origin::Page && !e.live_touched && e.layers.is_empty()
                })
            })
            .cloned()
            .collect();

        for id in &evicted {
            self.entries.remove(id);
        }
        let entries = &self.entries;
        self.order.retain(|id| entries.contains_key(id));
        self.history_exhausted = false;
        evicted
    }

    // --- Change events ---

    /// Apply one change feed event.
    pub fn apply_change_event(&mut self, event: &ChangeEvent) -> ApplyOutcome {
        match &event.record {
            EntityRecord::Post(post) => self.apply_post_event(event.op, post),
            EntityRecord::Comment(child) => {
                self.apply_child_event(EntityKind::Comment, event.op, child)
            }
            EntityRecord::Reaction(child) => {
                self.apply_child_event(EntityKind::Reaction, event.op, child)
            }
        }
    }

    fn apply_post_event(&mut self, op: ChangeOp, post: &Post) -> ApplyOutcome {
        match op {
            ChangeOp::Insert => {
                if self.entries.contains_key(&post.id) {
                    debug!(post = %post.id, "ignoring insert of known post");
                    return ApplyOutcome::default();
                }
                if !post.is_displayable() {
                    debug!(post = %post.id, "ignoring insert of hidden post");
                    return ApplyOutcome::default();
                }
                if self.is_removed(post) {
                    debug!(post = %post.id, "ignoring insert of removed post");
                    return ApplyOutcome::default();
                }
                if !self.history_exhausted {
                    if let Some((ts, id)) = self.tail_key() {
                        if post.order_key() < (ts, &id) {
                            debug!(post = %post.id, "dropping insert older than loaded window");
                            return ApplyOutcome::default();
                        }
                    }
                }
                self.insert_sorted(post.clone(), Origin::Live);
                ApplyOutcome {
                    applied: true,
                    ..Default::default()
                }
            }
            ChangeOp::Update => {
                let Some(entry) = self.entries.get_mut(&post.id) else {
                    if !post.is_displayable() {
                        self.removed_posts
                            .put(post.id.clone(), Tombstone::Hidden(post.version));
                    }
                    debug!(post = %post.id, "ignoring update of untracked post");
                    return ApplyOutcome::default();
                };
                if post.version <= entry.base.version {
                    debug!(
                        post = %post.id,
                        incoming = ?post.version,
                        stored = ?entry.base.version,
                        "discarding stale update"
                    );
                    return ApplyOutcome::default();
                }
                if !post.is_displayable() {
                    self.removed_posts
                        .put(post.id.clone(), Tombstone::Hidden(post.version));
                    return self.remove_post(&post.id, "post is no longer available");
                }

                let liked_by_me = entry.base.liked_by_me;
                let created_at = entry.base.created_at;
                entry.base = post.clone();
                entry.base.liked_by_me = liked_by_me;
                entry.base.created_at = created_at;
                entry.live_touched = true;

                ApplyOutcome {
                    applied: true,
                    closed_scopes: Vec::new(),
                    resolutions: self.reconcile(&post.id, post.version),
                }
            }
            ChangeOp::Delete => {
                self.removed_posts.put(post.id.clone(), Tombstone::Deleted);
                if !self.entries.contains_key(&post.id) {
                    debug!(post = %post.id, "delete of untracked post recorded");
                    return ApplyOutcome::default();
                }
                self.remove_post(&post.id, "post was deleted")
            }
        }
    }

    fn remove_post(&mut self, id: &PostId, reason: &str) -> ApplyOutcome {
        let mut outcome = ApplyOutcome {
            applied: true,
            closed_scopes: ScopeKey::child_scopes(id).to_vec(),
            resolutions: Vec::new(),
        };

        if let Some(entry) = self.entries.remove(id) {
            for layer in entry.layers {
                self.layer_targets.remove(&layer.mutation);
                outcome.resolutions.push(Resolution::Conflict {
                    mutation: layer.mutation,
                    reason: reason.to_string(),
                });
            }
        }
        self.order.retain(|other| other != id);
        self.expired_toggles.pop(id);
        outcome
    }

    fn apply_child_event(
        &mut self,
        kind: EntityKind,
        op: ChangeOp,
        child: &ChildRecord,
    ) -> ApplyOutcome {
        let mut outcome = ApplyOutcome::default();
        let Some(entry) = self.entries.get_mut(&child.post_id) else {
            debug!(post = %child.post_id, child = %child.id, "ignoring event for untracked post");
            return outcome;
        };
        entry.live_touched = true;

        // Edits and reaction type switches leave the counters alone.
        if op == ChangeOp::Update {
            return outcome;
        }

        let key = (kind, child.id.clone());
        match (op, self.seen_children.get(&key).copied()) {
            (ChangeOp::Insert, Some(_)) | (ChangeOp::Delete, Some(ChildState::Removed)) => {
                debug!(?kind, child = %child.id, ?op, "discarding duplicate child event");
                return outcome;
            }
            _ => {}
        }
        let state = if op == ChangeOp::Insert {
            ChildState::Present
        } else {
            ChildState::Removed
        };
        self.seen_children.put(key, state);
        outcome.applied = true;

        let own = child.actor_id == self.viewer;
        match kind {
            EntityKind::Comment => {
                if op == ChangeOp::Insert {
                    if own {
                        if let Some(layer) = entry.take_comment_layer(&child.id) {
                            self.layer_targets.remove(&layer.mutation);
                            outcome.resolutions.push(Resolution::Confirmed {
                                mutation: layer.mutation,
                                assigned_id: Some(child.id.clone()),
                            });
                        }
                    }
                    entry.base.comment_count += 1;
                } else {
                    entry.base.comment_count = entry.base.comment_count.saturating_sub(1);
                }
            }
            EntityKind::Reaction => {
                let liked = op == ChangeOp::Insert;
                if !own {
                    entry.base.reaction_count = if liked {
                        entry.base.reaction_count + 1
                    } else {
                        entry.base.reaction_count.saturating_sub(1)
                    };
                    return outcome;
                }

                let expired = self.expired_toggles.pop(&child.post_id);
                if let Some(index) = entry.first_reaction_layer() {
                    let layer = entry.layers.remove(index);
                    self.layer_targets.remove(&layer.mutation);
                    let resolution = if layer.effect == (Effect::Reaction { liked }) {
                        Resolution::Confirmed {
                            mutation: layer.mutation,
                            assigned_id: None,
                        }
                    } else {
                        Resolution::Conflict {
                            mutation: layer.mutation,
                            reason: "reaction was changed from another session".to_string(),
                        }
                    };
                    outcome.resolutions.push(resolution);
                } else if expired == Some(liked) {
                    debug!(post = %child.post_id, liked, "ignoring late echo of expired toggle");
                    return outcome;
                }

                // One reaction per viewer: a repeat of the known state is an echo.
                if entry.base.liked_by_me != liked {
                    entry.base.liked_by_me = liked;
                    entry.base.reaction_count = if liked {
                        entry.base.reaction_count + 1
                    } else {
                        entry.base.reaction_count.saturating_sub(1)
                    };
                } else {
                    debug!(post = %child.post_id, liked, "own reaction echo");
                }
            }
            EntityKind::Post => {}
        }
        outcome
    }

    // --- Optimistic layers ---

    /// Layer a local mutation over its target.
    pub fn apply_optimistic(&mut self, mutation: &PendingMutation) -> Result<()> {
        match (&mutation.target, &mutation.local_value) {
            (MutationTarget::Post(post), value) => {
                let effect = match value {
                    LocalValue::Liked(liked) => Effect::Reaction { liked: *liked },
                    LocalValue::Comment { .. } => Effect::Comment,
                    LocalValue::Following(_) => {
                        return Err(SyncError::InvalidOperation(format!(
                            "follow value on post {}",
                            post
                        )))
                    }
                };
                let entry = self
                    .entries
                    .get_mut(post)
                    .ok_or_else(|| SyncError::PostNotTracked(post.to_string()))?;
                if matches!(effect, Effect::Reaction { .. }) {
                    self.expired_toggles.pop(post);
                }
                entry.layers.push(Layer {
                    mutation: mutation.id,
                    effect,
                    acknowledged: None,
                    assigned_id: None,
                });
            }
            (MutationTarget::Author(author), LocalValue::Following(follow)) => {
                self.follow_layers
                    .entry(author.clone())
                    .or_default()
                    .push(FollowLayer {
                        mutation: mutation.id,
                        follow: *follow,
                    });
            }
            (MutationTarget::Author(author), value) => {
                return Err(SyncError::InvalidOperation(format!(
                    "{:?} on author {}",
                    value, author
                )))
            }
        }
        self.layer_targets
            .insert(mutation.id, mutation.target.clone());
        Ok(())
    }

    /// Record a successful receipt and confirm whatever it already settles.
    ///
    /// Follows have no change feed, so their receipt confirms them outright.
    pub fn acknowledge(&mut self, mutation: MutationId, receipt: &Receipt) -> Vec<Resolution> {
        match self.layer_targets.get(&mutation).cloned() {
            None => Vec::new(),
            Some(MutationTarget::Author(author)) => {
                let mut resolutions = Vec::new();
                if let Some(layers) = self.follow_layers.get_mut(&author) {
                    if let Some(index) = layers.iter().position(|l| l.mutation == mutation) {
                        let layer = layers.remove(index);
                        self.following.insert(author.clone(), layer.follow);
                        resolutions.push(Resolution::Confirmed {
                            mutation,
                            assigned_id: None,
                        });
                    }
                    if layers.is_empty() {
                        self.follow_layers.remove(&author);
                    }
                }
                self.layer_targets.remove(&mutation);
                resolutions
            }
            Some(MutationTarget::Post(post)) => {
                let Some(entry) = self.entries.get_mut(&post) else {
                    return Vec::new();
                };
                if let Some(layer) = entry.layers.iter_mut().find(|l| l.mutation == mutation) {
                    layer.acknowledged = Some(receipt.version);
                    if layer.effect == Effect::Comment {
                        layer.assigned_id = receipt.assigned_id.clone();
                    }
                }
                let current = entry.base.version;
                self.reconcile(&post, current)
            }
        }
    }

    /// Confirm acknowledged layers on `post` that `confirmed_version` covers.
    ///
    /// A comment layer without a server id waits for its own insert event,
    /// since folding it here would double count when that event arrives.
    pub fn reconcile(&mut self, post: &PostId, confirmed_version: Version) -> Vec<Resolution> {
        let Some(entry) = self.entries.get_mut(post) else {
            return Vec::new();
        };

        let mut resolutions = Vec::new();
        let mut index = 0;
        while index < entry.layers.len() {
            let layer = &entry.layers[index];
            let covered = matches!(layer.acknowledged, Some(v) if v <= confirmed_version);
            let foldable = match layer.effect {
                Effect::Reaction { .. } => true,
                Effect::Comment => layer.assigned_id.is_some(),
            };
            if !(covered && foldable) {
                index += 1;
                continue;
            }

            let layer = entry.layers.remove(index);
            self.layer_targets.remove(&layer.mutation);
            match layer.effect {
                Effect::Reaction { liked } => entry.base.liked_by_me = liked,
                Effect::Comment => {
                    if let Some(id) = &layer.assigned_id {
                        self.seen_children
                            .put((EntityKind::Comment, id.clone()), ChildState::Present);
                    }
                }
            }
            resolutions.push(Resolution::Confirmed {
                mutation: layer.mutation,
                assigned_id: layer.assigned_id,
            });
        }
        resolutions
    }

    /// Remove the layer of a mutation that timed out.
    ///
    /// The server may still apply a timed-out like or unlike; its echo is
    /// then ignored instead of re-applying what the viewer saw rolled back.
    pub fn expire(&mut self, mutation: MutationId) -> bool {
        if let Some(MutationTarget::Post(post)) = self.layer_targets.get(&mutation) {
            let liked = self
                .entries
                .get(post)
                .and_then(|entry| entry.layers.iter().find(|l| l.mutation == mutation))
                .and_then(|layer| match layer.effect {
                    Effect::Reaction { liked } => Some(liked),
                    Effect::Comment => None,
                });
            if let Some(liked) = liked {
                self.expired_toggles.put(post.clone(), liked);
            }
        }
        self.revert(mutation)
    }

    /// Remove a mutation's layer. Returns false if it was already gone.
    pub fn revert(&mut self, mutation: MutationId) -> bool {
        match self.layer_targets.remove(&mutation) {
            None => false,
            Some(MutationTarget::Post(post)) => self
                .entries
                .get_mut(&post)
                .map(|entry| {
                    let before = entry.layers.len();
                    entry.layers.retain(|l| l.mutation != mutation);
                    entry.layers.len() != before
                })
                .unwrap_or(false),
            Some(MutationTarget::Author(author)) => {
                let Some(layers) = self.follow_layers.get_mut(&author) else {
                    return false;
                };
                let before = layers.len();
                layers.retain(|l| l.mutation != mutation);
                let removed = layers.len() != before;
                if layers.is_empty() {
                    self.follow_layers.remove(&author);
                }
                removed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mutations::{MutationKind, MutationState, Submission};
    use std::time::Instant;

    fn store() -> FeedStore {
        FeedStore::new(AuthorId::from("me"), 64)
    }

    fn post(id: &str, ts: i64) -> Post {
        Post::new(id, "author", Timestamp(ts), format!("caption {}", id))
    }

    fn like(id: u64, post: &str, liked: bool) -> PendingMutation {
        PendingMutation {
            id: MutationId(id),
            target: MutationTarget::Post(PostId::from(post)),
            kind: if liked {
                MutationKind::Like
            } else {
                MutationKind::Unlike
            },
            local_value: LocalValue::Liked(liked),
            submitted_at: Instant::now(),
            retry_count: 0,
            state: MutationState::Staged,
            next_attempt_at: None,
            submission: Submission::Like {
                post: PostId::from(post),
            },
        }
    }

    fn reaction(op: ChangeOp, id: &str, post: &str, actor: &str) -> ChangeEvent {
        ChangeEvent::reaction(op, ChildRecord::new(id, &PostId::from(post), actor))
    }

    #[test]
    fn test_seed_orders_newest_first_and_skips_duplicates() {
        let mut store = store();
        let merge = store.seed(vec![post("b", 20), post("a", 30), post("b", 20)]);

        assert_eq!(merge, PageMerge { added: 2, skipped: 1 });
        assert_eq!(store.ids(), vec![PostId::from("a"), PostId::from("b")]);
    }

    #[test]
    fn test_live_insert_goes_to_head() {
        let mut store = store();
        store.seed(vec![post("a", 30), post("b", 20)]);

        let outcome = store.apply_change_event(&ChangeEvent::post(ChangeOp::Insert, post("c", 40)));
        assert!(outcome.applied);
        assert_eq!(store.ids()[0], PostId::from("c"));
        assert_eq!(store.origin(&PostId::from("c")), Some(Origin::Live));
    }

    #[test]
    fn test_insert_older_than_window_dropped_until_history_exhausted() {
        let mut store = store();
        store.seed(vec![post("a", 30), post("b", 20)]);

        let old = ChangeEvent::post(ChangeOp::Insert, post("old", 5));
        assert!(!store.apply_change_event(&old).applied);

        store.set_history_exhausted(true);
        assert!(store.apply_change_event(&old).applied);
        assert_eq!(store.ids().last(), Some(&PostId::from("old")));
    }

    #[test]
    fn test_update_hiding_post_removes_it() {
        let mut store = store();
        store.seed(vec![post("a", 30)]);

        let mut hidden = post("a", 30).with_version(2);
        hidden.hidden = true;
        let outcome = store.apply_change_event(&ChangeEvent::post(ChangeOp::Update, hidden));

        assert!(outcome.applied);
        assert!(store.is_empty());
        assert_eq!(outcome.closed_scopes.len(), 2);
    }

    #[test]
    fn test_update_keeps_viewer_flag() {
        let mut store = store();
        let mut liked = post("a", 30);
        liked.liked_by_me = true;
        store.seed(vec![liked]);

        let update = post("a", 30).with_version(2).with_counts(0, 7);
        store.apply_change_event(&ChangeEvent::post(ChangeOp::Update, update));

        let item = store.get(&PostId::from("a")).unwrap();
        assert!(item.post.liked_by_me);
        assert_eq!(item.post.reaction_count, 7);
    }

    #[test]
    fn test_own_reaction_confirms_like_without_double_count() {
        let mut store = store();
        store.seed(vec![post("a", 30).with_counts(0, 5)]);
        store.apply_optimistic(&like(1, "a", true)).unwrap();
        assert_eq!(store.get(&PostId::from("a")).unwrap().post.reaction_count, 6);

        let outcome = store.apply_change_event(&reaction(ChangeOp::Insert, "r1", "a", "me"));
        assert_eq!(
            outcome.resolutions,
            vec![Resolution::Confirmed {
                mutation: MutationId(1),
                assigned_id: None
            }]
        );

        let item = store.get(&PostId::from("a")).unwrap();
        assert_eq!(item.post.reaction_count, 6);
        assert!(item.post.liked_by_me);
        assert_eq!(item.pending, 0);
    }

    #[test]
    fn test_own_unlike_elsewhere_conflicts_with_pending_like() {
        let mut store = store();
        let mut liked = post("a", 30).with_counts(0, 5);
        liked.liked_by_me = true;
        store.seed(vec![liked]);
        // Local unlike pending, another session re-likes.
        store.apply_optimistic(&like(1, "a", false)).unwrap();

        let outcome = store.apply_change_event(&reaction(ChangeOp::Insert, "r2", "a", "me"));
        assert!(matches!(
            outcome.resolutions.as_slice(),
            [Resolution::Conflict { mutation: MutationId(1), .. }]
        ));
        let item = store.get(&PostId::from("a")).unwrap();
        assert!(item.post.liked_by_me);
        assert_eq!(item.post.reaction_count, 5);
    }

    #[test]
    fn test_acknowledged_like_confirmed_by_newer_version() {
        let mut store = store();
        store.seed(vec![post("a", 30).with_counts(0, 5)]);
        store.apply_optimistic(&like(1, "a", true)).unwrap();

        assert!(store.acknowledge(MutationId(1), &Receipt::at(2)).is_empty());

        let update = post("a", 30).with_version(2).with_counts(0, 6);
        let outcome = store.apply_change_event(&ChangeEvent::post(ChangeOp::Update, update));
        assert_eq!(outcome.resolutions.len(), 1);

        // The echo of our own reaction must not count twice.
        store.apply_change_event(&reaction(ChangeOp::Insert, "r1", "a", "me"));
        let item = store.get(&PostId::from("a")).unwrap();
        assert_eq!(item.post.reaction_count, 6);
        assert!(item.post.liked_by_me);
    }

    #[test]
    fn test_delete_reverts_layers_as_conflicts() {
        let mut store = store();
        store.seed(vec![post("a", 30)]);
        store.apply_optimistic(&like(1, "a", true)).unwrap();

        let outcome = store.apply_change_event(&ChangeEvent::post(ChangeOp::Delete, post("a", 30)));
        assert!(matches!(
            outcome.resolutions.as_slice(),
            [Resolution::Conflict { .. }]
        ));
        assert_eq!(store.pending_layers(), 0);
        assert!(!store.revert(MutationId(1)));
    }

    #[test]
    fn test_deleted_post_stays_out_of_later_pages() {
        let mut store = store();
        store.seed(vec![post("a", 30), post("b", 20)]);

        store.apply_change_event(&ChangeEvent::post(ChangeOp::Delete, post("b", 20)));
        // Deleted before it was ever loaded.
        store.apply_change_event(&ChangeEvent::post(ChangeOp::Delete, post("c", 10)));

        let merge = store.merge_page(vec![post("b", 20), post("c", 10), post("d", 5)]);
        assert_eq!(merge, PageMerge { added: 1, skipped: 2 });
        assert_eq!(store.ids(), vec![PostId::from("a"), PostId::from("d")]);

        store.set_history_exhausted(true);
        let insert = ChangeEvent::post(ChangeOp::Insert, post("b", 20));
        assert!(!store.apply_change_event(&insert).applied);
        assert!(!store.contains(&PostId::from("b")));
    }

    #[test]
    fn test_hidden_post_returns_only_with_newer_version() {
        let mut store = store();
        store.seed(vec![post("a", 30), post("b", 20)]);

        let mut hidden = post("b", 20).with_version(2);
        hidden.hidden = true;
        store.apply_change_event(&ChangeEvent::post(ChangeOp::Update, hidden));

        assert_eq!(store.merge_page(vec![post("b", 20)]).added, 0);
        assert_eq!(store.merge_page(vec![post("b", 20).with_version(3)]).added, 1);
        assert!(store.contains(&PostId::from("b")));
    }

    #[test]
    fn test_expired_like_ignores_late_echo() {
        let mut store = store();
        store.seed(vec![post("a", 30).with_counts(0, 5)]);
        store.apply_optimistic(&like(1, "a", true)).unwrap();

        assert!(store.expire(MutationId(1)));
        assert_eq!(store.get(&PostId::from("a")).unwrap().post.reaction_count, 5);

        let outcome = store.apply_change_event(&reaction(ChangeOp::Insert, "r1", "a", "me"));
        assert!(outcome.resolutions.is_empty());
        let item = store.get(&PostId::from("a")).unwrap();
        assert!(!item.post.liked_by_me);
        assert_eq!(item.post.reaction_count, 5);

        // Only the one echo is swallowed.
        store.apply_change_event(&reaction(ChangeOp::Insert, "r2", "a", "me"));
        assert!(store.get(&PostId::from("a")).unwrap().post.liked_by_me);
    }

    #[test]
    fn test_refresh_evict_keeps_live_and_pending() {
        let mut store = store();
        store.seed(vec![post("a", 50), post("b", 40), post("c", 30), post("d", 20)]);
        store.apply_optimistic(&like(1, "c", true)).unwrap();
        store.apply_change_event(&reaction(ChangeOp::Insert, "r1", "d", "other"));

        let evicted = store.refresh_evict(1);
        assert_eq!(evicted, vec![PostId::from("b")]);
        assert_eq!(
            store.ids(),
            vec![PostId::from("a"), PostId::from("c"), PostId::from("d")]
        );
    }

    #[test]
    fn test_stale_hint_from_degraded_scope() {
        let mut store = store();
        store.seed(vec![post("a", 30)]);
        store.set_degraded([ScopeKey::ReactionsOnPost(PostId::from("a"))]);
        assert!(store.get(&PostId::from("a")).unwrap().stale);

        store.set_degraded(Vec::new());
        assert!(!store.get(&PostId::from("a")).unwrap().stale);
    }
}
