//! Feed session tying the sync components together.

use crate::changefeed::{ChangeEvent, ChangeFeedTransport, ChangeOp, EntityRecord, ScopeKey};
use crate::compose::{prepare_draft, CaptionGenerator, PostDraft, PostPublisher};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::moderation::{AllowAll, ModerationGate, ModerationVerdict};
use crate::mutations::{MutationId, MutationState, MutationSubmitter, OptimisticMutationQueue};
use crate::notice::Notice;
use crate::pagination::{fetch_page, PageOutcome, PageRequest, PageSource, PaginationCursor};
use crate::store::{FeedStore, PageMerge};
use crate::subscriptions::{MultiplexReport, ScopeStatus, SubscriptionMultiplexer};
use crate::types::{AuthorId, FeedItem, Post, PostId};
use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// External services the session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub transport: Arc<dyn ChangeFeedTransport>,
    pub pages: Arc<dyn PageSource>,
    pub submitter: Arc<dyn MutationSubmitter>,
    pub moderation: Arc<dyn ModerationGate>,
    pub captions: Option<Arc<dyn CaptionGenerator>>,
    pub publisher: Option<Arc<dyn PostPublisher>>,
}

impl Collaborators {
    /// Collaborators with moderation that allows everything and no composer.
    pub fn new(
        transport: Arc<dyn ChangeFeedTransport>,
        pages: Arc<dyn PageSource>,
        submitter: Arc<dyn MutationSubmitter>,
    ) -> Self {
        Self {
            transport,
            pages,
            submitter,
            moderation: Arc::new(AllowAll),
            captions: None,
            publisher: None,
        }
    }

    pub fn with_moderation(mut self, gate: Arc<dyn ModerationGate>) -> Self {
        self.moderation = gate;
        self
    }

    pub fn with_captions(mut self, generator: Arc<dyn CaptionGenerator>) -> Self {
        self.captions = Some(generator);
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn PostPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }
}

/// A live, paginated feed for one viewer.
///
/// All display state lives in one [`FeedStore`] behind a single lock; every
/// producer (page loads, change feeds, the viewer's own mutations) applies
/// its changes in short write sections. Network calls never run with the
/// store locked.
///
/// Lock order is pager, then queue, then store. The subscription
/// multiplexer is never held together with the store.
pub struct FeedSession {
    config: SyncConfig,
    store: RwLock<FeedStore>,
    queue: Mutex<OptimisticMutationQueue>,
    pager: Mutex<PaginationCursor>,
    subscriptions: Mutex<SubscriptionMultiplexer>,
    /// Posts on screen; `None` subscribes to every loaded post.
    viewport: Mutex<Option<Vec<PostId>>>,
    collaborators: Collaborators,
    notice_tx: Sender<Notice>,
    notice_rx: Receiver<Notice>,
}

impl FeedSession {
    pub fn new(config: SyncConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let (notice_tx, notice_rx) = unbounded();
        let subscriptions = SubscriptionMultiplexer::new(
            Arc::clone(&collaborators.transport),
            config.subscribe_retry.clone(),
        );

        info!(viewer = %config.viewer_id, page_size = config.page_size, "feed session created");

        Ok(Self {
            store: RwLock::new(FeedStore::from_config(&config)),
            queue: Mutex::new(OptimisticMutationQueue::from_config(&config)),
            pager: Mutex::new(PaginationCursor::new(config.page_size)),
            subscriptions: Mutex::new(subscriptions),
            viewport: Mutex::new(None),
            collaborators,
            notice_tx,
            notice_rx,
            config,
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    // --- Pages ---

    /// Load the first page and subscribe to its scopes.
    ///
    /// Always fetches from the top. Once the feed holds posts this does
    /// nothing; use [`refresh`](Self::refresh) to reload.
    pub fn load_initial(&self, now: Instant) -> Result<PageMerge> {
        let request = {
            let mut pager = self.pager.lock();
            if !self.store.read().is_empty() {
                debug!("feed already loaded, skipping initial load");
                return Ok(PageMerge::default());
            }
            pager.refresh()
        };
        self.load(request, PageKind::Initial, now)
    }

    /// Load the next older page. Does nothing once history is exhausted.
    pub fn load_more(&self, now: Instant) -> Result<PageMerge> {
        let request = self.pager.lock().begin();
        match request {
            Some(request) => self.load(request, PageKind::Older, now),
            None => {
                debug!("history exhausted, nothing to load");
                Ok(PageMerge::default())
            }
        }
    }

    /// Reload from the top, evicting old untouched history.
    ///
    /// Any page fetch still in flight is discarded when it completes.
    pub fn refresh(&self, now: Instant) -> Result<PageMerge> {
        let request = self.pager.lock().refresh();
        self.load(request, PageKind::Refresh, now)
    }

    fn load(&self, request: PageRequest, kind: PageKind, now: Instant) -> Result<PageMerge> {
        let page = fetch_page(
            self.collaborators.pages.as_ref(),
            &request,
            &self.config.fetch_retry,
        )?;

        let merge = {
            let mut pager = self.pager.lock();
            match pager.complete(&request, &page) {
                PageOutcome::Accepted { exhausted } => {
                    let mut store = self.store.write();
                    let merge = match kind {
                        PageKind::Initial => store.seed(page),
                        PageKind::Older => store.merge_page(page),
                        PageKind::Refresh => {
                            let evicted = store.refresh_evict(self.config.retained_window);
                            if !evicted.is_empty() {
                                debug!(evicted = evicted.len(), "evicted history on refresh");
                            }
                            store.merge_page(page)
                        }
                    };
                    store.set_history_exhausted(exhausted);
                    merge
                }
                PageOutcome::Superseded | PageOutcome::Repeated => PageMerge {
                    added: 0,
                    skipped: page.len(),
                },
            }
        };

        debug!(?kind, added = merge.added, skipped = merge.skipped, "page merged");
        self.sync_subscriptions(now);
        Ok(merge)
    }

    // --- Subscriptions ---

    /// Restrict subscriptions to the posts on screen (`None` for all loaded).
    pub fn set_viewport(&self, visible: Option<Vec<PostId>>, now: Instant) -> MultiplexReport {
        *self.viewport.lock() = visible;
        self.sync_subscriptions(now)
    }

    /// Recompute the desired scope set and open or close channels to match.
    pub fn sync_subscriptions(&self, now: Instant) -> MultiplexReport {
        let desired = {
            let viewport = self.viewport.lock();
            self.store.read().desired_scopes(viewport.as_deref())
        };
        self.with_subscriptions(|mux| mux.reconcile(desired, now))
    }

    /// Drain every change feed and apply the events. Returns how many changed
    /// the store.
    pub fn pump(&self, now: Instant) -> usize {
        let (events, _) = self.with_subscriptions(|mux| mux.drain(now));
        self.apply_events(events, now)
    }

    /// Apply one event delivered outside the multiplexer.
    pub fn ingest(&self, event: ChangeEvent, now: Instant) -> bool {
        self.apply_events(vec![event], now) > 0
    }

    fn apply_events(&self, events: Vec<ChangeEvent>, now: Instant) -> usize {
        if events.is_empty() {
            return 0;
        }

        let mut applied = 0;
        let mut closed = Vec::new();
        let mut posts_changed = false;
        let notices = {
            let mut queue = self.queue.lock();
            let mut store = self.store.write();
            let mut notices = Vec::new();
            for event in &events {
                let outcome = store.apply_change_event(event);
                if !outcome.applied {
                    continue;
                }
                applied += 1;
                if matches!(event.record, EntityRecord::Post(_)) {
                    posts_changed = true;
                }
                closed.extend(outcome.closed_scopes);
                notices.extend(queue.resolve(outcome.resolutions));
            }
            notices
        };
        self.emit(notices);

        if !closed.is_empty() {
            self.with_subscriptions(|mux| mux.close_scopes(&closed));
        }
        if posts_changed {
            self.sync_subscriptions(now);
        }
        applied
    }

    /// Run `f` on the multiplexer, then mirror its outcome into the store's
    /// stale hints and the notice channel.
    fn with_subscriptions<T>(
        &self,
        f: impl FnOnce(&mut SubscriptionMultiplexer) -> T,
    ) -> T
    where
        T: AsReport,
    {
        let (result, degraded) = {
            let mut mux = self.subscriptions.lock();
            let result = f(&mut *mux);
            (result, mux.degraded_scopes())
        };

        let report = result.report();
        let notices: Vec<Notice> = report
            .degraded
            .iter()
            .map(|scope| Notice::ScopeDegraded {
                scope: scope.clone(),
            })
            .chain(report.recovered.iter().map(|scope| Notice::ScopeRecovered {
                scope: scope.clone(),
            }))
            .collect();
        self.store.write().set_degraded(degraded);
        self.emit(notices);
        result
    }

    // --- Mutations ---

    pub fn like(&self, post: &PostId, now: Instant) -> Result<Option<MutationId>> {
        self.set_liked(post, true, now)
    }

    pub fn unlike(&self, post: &PostId, now: Instant) -> Result<Option<MutationId>> {
        self.set_liked(post, false, now)
    }

    fn set_liked(&self, post: &PostId, liked: bool, now: Instant) -> Result<Option<MutationId>> {
        let mut queue = self.queue.lock();
        let mut store = self.store.write();
        queue.enqueue_like(&mut store, post, liked, now)
    }

    /// Add a comment after moderation. Returns the mutation and the temp id
    /// shown until the server assigns one.
    pub fn add_comment(
        &self,
        post: &PostId,
        text: &str,
        now: Instant,
    ) -> Result<(MutationId, String)> {
        self.moderate(text)?;
        let mut queue = self.queue.lock();
        let mut store = self.store.write();
        queue.enqueue_comment(&mut store, post, text, now)
    }

    pub fn set_follow(
        &self,
        author: &AuthorId,
        follow: bool,
        now: Instant,
    ) -> Result<Option<MutationId>> {
        let mut queue = self.queue.lock();
        let mut store = self.store.write();
        queue.enqueue_follow(&mut store, author, follow, now)
    }

    fn moderate(&self, text: &str) -> Result<()> {
        match self.collaborators.moderation.review(text) {
            ModerationVerdict::Allow => Ok(()),
            ModerationVerdict::Flag => {
                warn!(viewer = %self.config.viewer_id, "content flagged by moderation");
                Ok(())
            }
            ModerationVerdict::Reject(reason) => {
                self.emit([Notice::ModerationRejected {
                    reason: reason.clone(),
                }]);
                Err(SyncError::ModerationRejected(reason))
            }
        }
    }

    /// Submit every due mutation and apply the results. Returns how many
    /// submissions were made.
    pub fn flush(&self, now: Instant) -> usize {
        let due = self.queue.lock().take_due(now);
        let submitted = due.len();

        for (id, submission) in due {
            let result = self.collaborators.submitter.submit(&submission);
            let notices = {
                let mut queue = self.queue.lock();
                let mut store = self.store.write();
                queue.complete(&mut store, id, result, now)
            };
            self.emit(notices);
        }
        submitted
    }

    /// Periodic work: submissions, timeouts, subscription retries.
    pub fn tick(&self, now: Instant) {
        self.flush(now);

        let expired = {
            let mut queue = self.queue.lock();
            let mut store = self.store.write();
            queue.expire(&mut store, now)
        };
        self.emit(expired);

        self.with_subscriptions(|mux| mux.tick(now));
    }

    // --- Composition ---

    /// Generate a missing caption, moderate, publish, and show the new post.
    pub fn publish_post(&self, draft: PostDraft, now: Instant) -> Result<Post> {
        let publisher = self
            .collaborators
            .publisher
            .as_ref()
            .ok_or_else(|| SyncError::InvalidOperation("no publisher configured".to_string()))?;

        let draft = match prepare_draft(
            draft,
            self.collaborators.captions.as_deref(),
            self.collaborators.moderation.as_ref(),
        ) {
            Ok(draft) => draft,
            Err(SyncError::ModerationRejected(reason)) => {
                self.emit([Notice::ModerationRejected {
                    reason: reason.clone(),
                }]);
                return Err(SyncError::ModerationRejected(reason));
            }
            Err(e) => return Err(e),
        };

        let post = publisher.publish(&draft).map_err(SyncError::Publish)?;
        info!(post = %post.id, "post published");

        self.ingest(ChangeEvent::post(ChangeOp::Insert, post.clone()), now);
        Ok(post)
    }

    // --- Reads ---

    /// The feed as displayed, newest first.
    pub fn snapshot(&self) -> Vec<FeedItem> {
        self.store.read().snapshot()
    }

    pub fn get(&self, post: &PostId) -> Option<FeedItem> {
        self.store.read().get(post)
    }

    pub fn len(&self) -> usize {
        self.store.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().is_empty()
    }

    pub fn is_following(&self, author: &AuthorId) -> bool {
        self.store.read().is_following(author)
    }

    /// Unconfirmed comments on a post as `(temp_id, text)`.
    pub fn pending_comments(&self, post: &PostId) -> Vec<(String, String)> {
        self.queue.lock().pending_comments(post)
    }

    pub fn mutation_state(&self, id: MutationId) -> Option<MutationState> {
        self.queue.lock().state(id)
    }

    pub fn pending_mutations(&self) -> usize {
        self.queue.lock().pending_count()
    }

    pub fn open_subscription_count(&self) -> usize {
        self.subscriptions.lock().open_count()
    }

    pub fn subscription_status(&self, scope: &ScopeKey) -> ScopeStatus {
        self.subscriptions.lock().status(scope)
    }

    pub fn history_exhausted(&self) -> bool {
        self.pager.lock().exhausted()
    }

    /// Receiver for user-facing notices.
    pub fn notices(&self) -> Receiver<Notice> {
        self.notice_rx.clone()
    }

    /// Take every notice queued so far.
    pub fn drain_notices(&self) -> Vec<Notice> {
        self.notice_rx.try_iter().collect()
    }

    fn emit(&self, notices: impl IntoIterator<Item = Notice>) {
        for notice in notices {
            debug!(%notice, "notice");
            // The session holds a receiver, so the channel never disconnects.
            let _ = self.notice_tx.send(notice);
        }
    }

    /// Close every subscription.
    pub fn close(&self) -> MultiplexReport {
        *self.viewport.lock() = None;
        let report = self.with_subscriptions(|mux| mux.close_all());
        info!(closed = report.closed.len(), "feed session closed");
        report
    }
}

#[derive(Clone, Copy, Debug)]
enum PageKind {
    Initial,
    Older,
    Refresh,
}

/// Results that carry a multiplexer report.
trait AsReport {
    fn report(&self) -> &MultiplexReport;
}

impl AsReport for MultiplexReport {
    fn report(&self) -> &MultiplexReport {
        self
    }
}

impl<T> AsReport for (T, MultiplexReport) {
    fn report(&self) -> &MultiplexReport {
        &self.1
    }
}
