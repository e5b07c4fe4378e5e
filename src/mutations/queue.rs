//! Optimistic mutation queue.

use super::types::{
    LocalValue, MutationId, MutationKind, MutationState, MutationTarget, PendingMutation, Receipt,
    RevertReason, SubmitError, Submission,
};
use crate::config::{RetryPolicy, SyncConfig};
use crate::error::{Result, SyncError};
use crate::notice::Notice;
use crate::store::{FeedStore, Resolution};
use crate::types::{AuthorId, PostId};
use lru::LruCache;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Terminal states remembered for `state()` lookups.
const SETTLED_CAPACITY: usize = 1024;

/// Tracks the viewer's mutations from local application to confirmation.
///
/// The queue owns the lifecycle; the layers themselves live in the
/// [`FeedStore`], so every state change that touches display state takes the
/// store as an argument and the caller decides how it is locked.
pub struct OptimisticMutationQueue {
    pending: BTreeMap<MutationId, PendingMutation>,
    settled: LruCache<MutationId, MutationState>,
    next_id: u64,
    next_temp: u64,
    timeout: Duration,
    retry: RetryPolicy,
}

impl OptimisticMutationQueue {
    pub fn new(timeout: Duration, retry: RetryPolicy) -> Self {
        let capacity = NonZeroUsize::new(SETTLED_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            pending: BTreeMap::new(),
            settled: LruCache::new(capacity),
            next_id: 1,
            next_temp: 1,
            timeout,
            retry,
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.mutation_timeout, config.submit_retry.clone())
    }

    // --- Enqueue ---

    /// Like or unlike a post.
    ///
    /// Returns `None` when nothing needs to go over the wire: the post already
    /// shows the requested state, or the request cancelled an opposite toggle
    /// that had not been submitted yet.
    pub fn enqueue_like(
        &mut self,
        store: &mut FeedStore,
        post: &PostId,
        liked: bool,
        now: Instant,
    ) -> Result<Option<MutationId>> {
        let displayed = store
            .get(post)
            .ok_or_else(|| SyncError::PostNotTracked(post.to_string()))?
            .post
            .liked_by_me;
        let target = MutationTarget::Post(post.clone());

        if let Some(cancelled) = self.coalesce(store, &target, &LocalValue::Liked(liked)) {
            debug!(post = %post, mutation = %cancelled, "like toggle cancelled out");
            return Ok(None);
        }
        if displayed == liked {
            return Ok(None);
        }

        let (kind, submission) = if liked {
            (MutationKind::Like, Submission::Like { post: post.clone() })
        } else {
            (MutationKind::Unlike, Submission::Unlike { post: post.clone() })
        };
        self.stage(store, target, kind, LocalValue::Liked(liked), submission, now)
            .map(Some)
    }

    /// Follow or unfollow an author.
    pub fn enqueue_follow(
        &mut self,
        store: &mut FeedStore,
        author: &AuthorId,
        follow: bool,
        now: Instant,
    ) -> Result<Option<MutationId>> {
        let displayed = store.is_following(author);
        let target = MutationTarget::Author(author.clone());

        if let Some(cancelled) = self.coalesce(store, &target, &LocalValue::Following(follow)) {
            debug!(author = %author, mutation = %cancelled, "follow toggle cancelled out");
            return Ok(None);
        }
        if displayed == follow {
            return Ok(None);
        }

        let submission = Submission::Follow {
            author: author.clone(),
            follow,
        };
        self.stage(
            store,
            target,
            MutationKind::FollowToggle,
            LocalValue::Following(follow),
            submission,
            now,
        )
        .map(Some)
    }

    /// Add a comment. Returns the mutation and the client temp id the UI
    /// shows until the server id is known.
    pub fn enqueue_comment(
        &mut self,
        store: &mut FeedStore,
        post: &PostId,
        text: &str,
        now: Instant,
    ) -> Result<(MutationId, String)> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SyncError::EmptyComment);
        }
        if !store.contains(post) {
            return Err(SyncError::PostNotTracked(post.to_string()));
        }

        let temp_id = format!("local-{}", self.next_temp);
        self.next_temp += 1;

        let submission = Submission::Comment {
            post: post.clone(),
            client_id: temp_id.clone(),
            text: text.to_string(),
        };
        let id = self.stage(
            store,
            MutationTarget::Post(post.clone()),
            MutationKind::CommentAdd,
            LocalValue::Comment {
                temp_id: temp_id.clone(),
                text: text.to_string(),
            },
            submission,
            now,
        )?;
        Ok((id, temp_id))
    }

    /// Cancel a never-submitted toggle on `target` that asserts the opposite
    /// value. A toggle that already hit the wire once stays, since the server
    /// may have applied it.
    fn coalesce(
        &mut self,
        store: &mut FeedStore,
        target: &MutationTarget,
        value: &LocalValue,
    ) -> Option<MutationId> {
        let id = self
            .pending
            .values()
            .rev()
            .find(|m| {
                m.target == *target
                    && m.kind.is_toggle()
                    && m.state == MutationState::Staged
                    && m.retry_count == 0
            })
            .filter(|m| m.local_value != *value)
            .map(|m| m.id)?;

        store.revert(id);
        self.pending.remove(&id);
        self.settled
            .put(id, MutationState::Reverted(RevertReason::Cancelled));
        Some(id)
    }

    fn stage(
        &mut self,
        store: &mut FeedStore,
        target: MutationTarget,
        kind: MutationKind,
        local_value: LocalValue,
        submission: Submission,
        now: Instant,
    ) -> Result<MutationId> {
        let mutation = PendingMutation {
            id: MutationId(self.next_id),
            target,
            kind,
            local_value,
            submitted_at: now,
            retry_count: 0,
            state: MutationState::Staged,
            next_attempt_at: None,
            submission,
        };
        store.apply_optimistic(&mutation)?;
        self.next_id += 1;

        let id = mutation.id;
        debug!(mutation = %id, ?kind, "mutation staged");
        self.pending.insert(id, mutation);
        Ok(id)
    }

    // --- Submission ---

    /// Move every staged mutation whose backoff has elapsed to `InFlight` and
    /// return what to submit, in submission order.
    pub fn take_due(&mut self, now: Instant) -> Vec<(MutationId, Submission)> {
        self.pending
            .values_mut()
            .filter(|m| m.state == MutationState::Staged)
            .filter(|m| m.next_attempt_at.map_or(true, |at| at <= now))
            .map(|m| {
                m.state = MutationState::InFlight;
                (m.id, m.submission.clone())
            })
            .collect()
    }

    /// Apply the result of a submission.
    pub fn complete(
        &mut self,
        store: &mut FeedStore,
        id: MutationId,
        result: std::result::Result<Receipt, SubmitError>,
        now: Instant,
    ) -> Vec<Notice> {
        let Some(mutation) = self.pending.get_mut(&id) else {
            debug!(mutation = %id, "ignoring late submission result");
            return Vec::new();
        };
        if mutation.state != MutationState::InFlight {
            debug!(mutation = %id, state = ?mutation.state, "ignoring unexpected submission result");
            return Vec::new();
        }

        match result {
            Ok(receipt) => {
                mutation.state = MutationState::Acknowledged(receipt.version);
                debug!(mutation = %id, version = ?receipt.version, "mutation acknowledged");
                let resolutions = store.acknowledge(id, &receipt);
                self.resolve(resolutions)
            }
            Err(SubmitError::Transport(reason)) => {
                mutation.retry_count += 1;
                if self.retry.allows_retry(mutation.retry_count) {
                    let delay = self.retry.backoff(mutation.retry_count);
                    warn!(
                        mutation = %id,
                        attempt = mutation.retry_count,
                        ?delay,
                        error = %reason,
                        "submission failed, retrying"
                    );
                    mutation.state = MutationState::Staged;
                    mutation.next_attempt_at = Some(now + delay);
                    return Vec::new();
                }
                let kind = mutation.kind;
                self.revert(store, id, RevertReason::TransportExhausted(reason.clone()));
                vec![Notice::MutationFailed {
                    mutation: id,
                    kind,
                    reason,
                }]
            }
            Err(SubmitError::Rejected(reason)) => {
                let kind = mutation.kind;
                self.revert(store, id, RevertReason::Rejected(reason.clone()));
                vec![Notice::MutationRejected {
                    mutation: id,
                    kind,
                    reason,
                }]
            }
        }
    }

    /// Settle mutations the store matched against authoritative data.
    ///
    /// The store has already dropped the matching layers.
    pub fn resolve(&mut self, resolutions: Vec<Resolution>) -> Vec<Notice> {
        let mut notices = Vec::new();
        for resolution in resolutions {
            let Some(mutation) = self.pending.remove(&resolution.mutation()) else {
                continue;
            };
            match resolution {
                Resolution::Confirmed { assigned_id, .. } => {
                    info!(mutation = %mutation.id, kind = ?mutation.kind, "mutation confirmed");
                    if let (LocalValue::Comment { temp_id, .. }, Some(server_id)) =
                        (&mutation.local_value, assigned_id)
                    {
                        notices.push(Notice::CommentConfirmed {
                            temp_id: temp_id.clone(),
                            server_id,
                        });
                    }
                    self.settled.put(mutation.id, MutationState::Confirmed);
                }
                Resolution::Conflict { reason, .. } => {
                    warn!(mutation = %mutation.id, kind = ?mutation.kind, %reason, "mutation conflicted");
                    notices.push(Notice::MutationConflict {
                        mutation: mutation.id,
                        kind: mutation.kind,
                        reason: reason.clone(),
                    });
                    self.settled.put(
                        mutation.id,
                        MutationState::Reverted(RevertReason::Conflict(reason)),
                    );
                }
            }
        }
        notices
    }

    /// Revert every mutation not confirmed within the timeout.
    pub fn expire(&mut self, store: &mut FeedStore, now: Instant) -> Vec<Notice> {
        let expired: Vec<(MutationId, MutationKind)> = self
            .pending
            .values()
            .filter(|m| now.saturating_duration_since(m.submitted_at) >= self.timeout)
            .map(|m| (m.id, m.kind))
            .collect();

        expired
            .into_iter()
            .map(|(id, kind)| {
                store.expire(id);
                self.revert(store, id, RevertReason::TimedOut);
                Notice::MutationTimedOut { mutation: id, kind }
            })
            .collect()
    }

    fn revert(&mut self, store: &mut FeedStore, id: MutationId, reason: RevertReason) {
        if self.pending.remove(&id).is_none() {
            return;
        }
        store.revert(id);
        warn!(mutation = %id, ?reason, "mutation reverted");
        self.settled.put(id, MutationState::Reverted(reason));
    }

    // --- Queries ---

    /// Current state of a mutation, if still remembered.
    pub fn state(&self, id: MutationId) -> Option<MutationState> {
        self.pending
            .get(&id)
            .map(|m| m.state.clone())
            .or_else(|| self.settled.peek(&id).cloned())
    }

    pub fn get(&self, id: MutationId) -> Option<&PendingMutation> {
        self.pending.get(&id)
    }

    /// Mutations not yet in a terminal state.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Unconfirmed comments on a post as `(temp_id, text)`, oldest first.
    pub fn pending_comments(&self, post: &PostId) -> Vec<(String, String)> {
        self.pending
            .values()
            .filter(|m| m.post_id() == Some(post))
            .filter_map(|m| match &m.local_value {
                LocalValue::Comment { temp_id, text } => Some((temp_id.clone(), text.clone())),
                _ => None,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changefeed::{ChangeEvent, ChangeOp, ChildRecord};
    use crate::types::{Post, Timestamp};

    fn setup() -> (OptimisticMutationQueue, FeedStore) {
        let retry = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
        };
        let queue = OptimisticMutationQueue::new(Duration::from_secs(10), retry);
        let mut store = FeedStore::new(AuthorId::from("me"), 64);
        store.seed(vec![
            Post::new("p1", "alice", Timestamp(100), "hello").with_counts(2, 5)
        ]);
        (queue, store)
    }

    fn p1() -> PostId {
        PostId::from("p1")
    }

    fn reactions(store: &FeedStore) -> u64 {
        store.get(&p1()).unwrap().post.reaction_count
    }

    // --- Coalescing ---

    #[test]
    fn test_like_then_unlike_cancels_without_submission() {
        let (mut queue, mut store) = setup();
        let now = Instant::now();

        let like = queue.enqueue_like(&mut store, &p1(), true, now).unwrap();
        assert!(like.is_some());
        assert_eq!(reactions(&store), 6);

        let unlike = queue.enqueue_like(&mut store, &p1(), false, now).unwrap();
        assert!(unlike.is_none());
        assert_eq!(reactions(&store), 5);
        assert!(queue.take_due(now).is_empty());
        assert_eq!(
            queue.state(like.unwrap()),
            Some(MutationState::Reverted(RevertReason::Cancelled))
        );
    }

    #[test]
    fn test_repeated_like_is_noop() {
        let (mut queue, mut store) = setup();
        let now = Instant::now();

        queue.enqueue_like(&mut store, &p1(), true, now).unwrap();
        assert!(queue.enqueue_like(&mut store, &p1(), true, now).unwrap().is_none());
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(reactions(&store), 6);
    }

    #[test]
    fn test_unlike_after_submission_is_new_mutation() {
        let (mut queue, mut store) = setup();
        let now = Instant::now();

        queue.enqueue_like(&mut store, &p1(), true, now).unwrap();
        assert_eq!(queue.take_due(now).len(), 1);

        let unlike = queue.enqueue_like(&mut store, &p1(), false, now).unwrap();
        assert!(unlike.is_some());
        assert_eq!(reactions(&store), 5);
        assert_eq!(queue.pending_count(), 2);
    }

    // --- Submission results ---

    #[test]
    fn test_transport_failure_retries_then_fails() {
        let (mut queue, mut store) = setup();
        let now = Instant::now();
        let id = queue.enqueue_like(&mut store, &p1(), true, now).unwrap().unwrap();

        queue.take_due(now);
        let notices = queue.complete(&mut store, id, Err(SubmitError::Transport("reset".into())), now);
        assert!(notices.is_empty());
        assert_eq!(queue.state(id), Some(MutationState::Staged));
        assert!(queue.take_due(now).is_empty());

        let later = now + Duration::from_millis(100);
        assert_eq!(queue.take_due(later).len(), 1);
        queue.complete(&mut store, id, Err(SubmitError::Transport("reset".into())), later);

        let last = later + Duration::from_millis(200);
        assert_eq!(queue.take_due(last).len(), 1);
        let notices = queue.complete(&mut store, id, Err(SubmitError::Transport("reset".into())), last);

        assert!(matches!(notices.as_slice(), [Notice::MutationFailed { .. }]));
        assert_eq!(reactions(&store), 5);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn test_rejection_reverts_immediately() {
        let (mut queue, mut store) = setup();
        let now = Instant::now();
        let id = queue.enqueue_like(&mut store, &p1(), true, now).unwrap().unwrap();

        queue.take_due(now);
        let notices = queue.complete(&mut store, id, Err(SubmitError::Rejected("locked".into())), now);

        assert_eq!(
            notices,
            vec![Notice::MutationRejected {
                mutation: id,
                kind: MutationKind::Like,
                reason: "locked".into()
            }]
        );
        assert_eq!(reactions(&store), 5);
        assert!(!store.get(&p1()).unwrap().post.liked_by_me);
    }

    #[test]
    fn test_timeout_reverts_and_ignores_late_receipt() {
        let (mut queue, mut store) = setup();
        let now = Instant::now();
        let id = queue.enqueue_like(&mut store, &p1(), true, now).unwrap().unwrap();
        queue.take_due(now);

        assert!(queue.expire(&mut store, now + Duration::from_secs(9)).is_empty());
        let notices = queue.expire(&mut store, now + Duration::from_secs(10));
        assert!(matches!(notices.as_slice(), [Notice::MutationTimedOut { .. }]));
        assert_eq!(reactions(&store), 5);

        let late = queue.complete(&mut store, id, Ok(Receipt::at(2)), now + Duration::from_secs(11));
        assert!(late.is_empty());
        assert_eq!(reactions(&store), 5);
        assert_eq!(
            queue.state(id),
            Some(MutationState::Reverted(RevertReason::TimedOut))
        );
    }

    #[test]
    fn test_timeout_ignores_late_echo() {
        let (mut queue, mut store) = setup();
        let now = Instant::now();
        queue.enqueue_like(&mut store, &p1(), true, now).unwrap();
        queue.take_due(now);
        queue.expire(&mut store, now + Duration::from_secs(10));

        let echo = ChangeEvent::reaction(ChangeOp::Insert, ChildRecord::new("r1", &p1(), "me"));
        let outcome = store.apply_change_event(&echo);

        assert!(queue.resolve(outcome.resolutions).is_empty());
        assert!(!store.get(&p1()).unwrap().post.liked_by_me);
        assert_eq!(reactions(&store), 5);
    }

    // --- Comments ---

    #[test]
    fn test_comment_confirmed_by_own_insert() {
        let (mut queue, mut store) = setup();
        let now = Instant::now();
        let (id, temp) = queue.enqueue_comment(&mut store, &p1(), " nice ", now).unwrap();
        assert_eq!(temp, "local-1");
        assert_eq!(
            queue.pending_comments(&p1()),
            vec![("local-1".to_string(), "nice".to_string())]
        );

        queue.take_due(now);
        queue.complete(&mut store, id, Ok(Receipt::at(2).with_id("c9")), now);
        assert_eq!(queue.state(id), Some(MutationState::Acknowledged(crate::types::Version(2))));

        let event = ChangeEvent::comment(ChangeOp::Insert, ChildRecord::new("c9", &p1(), "me"));
        let outcome = store.apply_change_event(&event);
        let notices = queue.resolve(outcome.resolutions);

        assert_eq!(
            notices,
            vec![Notice::CommentConfirmed {
                temp_id: "local-1".into(),
                server_id: "c9".into()
            }]
        );
        assert_eq!(store.get(&p1()).unwrap().post.comment_count, 3);
    }

    #[test]
    fn test_empty_comment_rejected() {
        let (mut queue, mut store) = setup();
        let result = queue.enqueue_comment(&mut store, &p1(), "   ", Instant::now());
        assert!(matches!(result, Err(SyncError::EmptyComment)));
    }

    // --- Follows ---

    #[test]
    fn test_follow_confirmed_by_receipt() {
        let (mut queue, mut store) = setup();
        let now = Instant::now();
        let alice = AuthorId::from("alice");

        let id = queue.enqueue_follow(&mut store, &alice, true, now).unwrap().unwrap();
        assert!(store.is_following(&alice));

        queue.take_due(now);
        queue.complete(&mut store, id, Ok(Receipt::at(1)), now);

        assert_eq!(queue.state(id), Some(MutationState::Confirmed));
        assert!(store.is_following(&alice));
        assert_eq!(store.pending_layers(), 0);
    }
}
