//! In-process change feed transport.
//!
//! Broadcasts published events to every subscriber of the event's scope
//! through bounded channels. A subscriber whose buffer fills up is dropped
//! and told so with [`DropReason::BufferOverflow`]. Open and close failures
//! can be injected to exercise retry paths.

use super::transport::{ChangeFeedTransport, FeedCloser, FeedHandle};
use super::types::{ChangeEvent, DropReason, FeedMessage, ScopeKey};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crossbeam_channel::{bounded, Sender, TrySendError};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// Default buffered messages per subscriber.
const DEFAULT_BUFFER: usize = 1000;

/// Internal subscriber state.
struct Subscriber {
    scope: ScopeKey,
    sender: Sender<FeedMessage>,
}

impl Subscriber {
    /// Try to send a message. Returns false if the subscriber must be dropped.
    fn try_send(&self, message: FeedMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => false,
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

struct Inner {
    subscribers: RwLock<HashMap<u64, Subscriber>>,
    next_id: AtomicU64,
    buffer_size: usize,
    /// Remaining subscribe calls that should fail.
    failing_opens: AtomicU32,
    /// Remaining close calls that should fail.
    failing_closes: AtomicU32,
    /// Total successful subscribe calls.
    opens: AtomicU64,
}

impl Inner {
    fn remove(&self, id: u64, reason: DropReason) {
        if let Some(sub) = self.subscribers.write().remove(&id) {
            // Best effort, the receiver may already be gone.
            let _ = sub.sender.try_send(FeedMessage::Dropped { reason });
        }
    }
}

/// Broadcasting transport living in the same process.
#[derive(Clone)]
pub struct LocalTransport {
    inner: Arc<Inner>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER)
    }

    /// Transport sized by `config.channel_buffer`.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::with_buffer_size(config.channel_buffer)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: RwLock::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                buffer_size: buffer_size.max(1),
                failing_opens: AtomicU32::new(0),
                failing_closes: AtomicU32::new(0),
                opens: AtomicU64::new(0),
            }),
        }
    }

    /// Make the next `count` subscribe calls fail.
    pub fn fail_next_opens(&self, count: u32) {
        self.inner.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` close calls fail.
    pub fn fail_next_closes(&self, count: u32) {
        self.inner.failing_closes.store(count, Ordering::SeqCst);
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Number of live subscribers on one scope.
    pub fn subscribers_on(&self, scope: &ScopeKey) -> usize {
        self.inner
            .subscribers
            .read()
            .values()
            .filter(|s| &s.scope == scope)
            .count()
    }

    /// Successful subscribe calls so far.
    pub fn open_calls(&self) -> u64 {
        self.inner.opens.load(Ordering::SeqCst)
    }

    /// Deliver an event to every subscriber of its scope.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        let mut delivered = 0;
        let mut to_remove = Vec::new();

        {
            let subs = self.inner.subscribers.read();
            for (id, sub) in subs.iter() {
                if sub.scope != event.scope {
                    continue;
                }
                if sub.try_send(FeedMessage::Change(event.clone())) {
                    delivered += 1;
                } else {
                    to_remove.push(*id);
                }
            }
        }

        for id in to_remove {
            tracing::debug!(subscriber = id, scope = %event.scope, "dropping slow subscriber");
            self.inner.remove(id, DropReason::BufferOverflow);
        }

        delivered
    }

    /// Drop every subscriber of `scope` with a transport error.
    pub fn disconnect_scope(&self, scope: &ScopeKey, reason: &str) {
        let ids: Vec<u64> = self
            .inner
            .subscribers
            .read()
            .iter()
            .filter(|(_, s)| &s.scope == scope)
            .map(|(id, _)| *id)
            .collect();
        for id in ids {
            self.inner.remove(id, DropReason::Error(reason.to_string()));
        }
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new()
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl ChangeFeedTransport for LocalTransport {
    fn subscribe(&self, scope: &ScopeKey) -> Result<FeedHandle> {
        if take_failure(&self.inner.failing_opens) {
            return Err(SyncError::SubscribeFailed {
                scope: scope.clone(),
                reason: "injected open failure".to_string(),
            });
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let (sender, receiver) = bounded(self.inner.buffer_size);

        let subscriber = Subscriber {
            scope: scope.clone(),
            sender,
        };
        // Confirmation is the first message on the handle.
        subscriber.try_send(FeedMessage::Subscribed);

        self.inner.subscribers.write().insert(id, subscriber);
        self.inner.opens.fetch_add(1, Ordering::SeqCst);

        let closer = LocalCloser {
            inner: Arc::clone(&self.inner),
            id,
            closed: false,
        };
        Ok(FeedHandle::new(scope.clone(), receiver, Box::new(closer)))
    }
}

struct LocalCloser {
    inner: Arc<Inner>,
    id: u64,
    closed: bool,
}

impl FeedCloser for LocalCloser {
    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        if take_failure(&self.inner.failing_closes) {
            return Err(SyncError::Transport("injected close failure".to_string()));
        }
        self.inner.remove(self.id, DropReason::Unsubscribed);
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::changefeed::types::{ChangeOp, ChildRecord};
    use crate::types::PostId;
    use std::time::Duration;

    fn comment_event(post: &str, id: &str) -> ChangeEvent {
        ChangeEvent::comment(
            ChangeOp::Insert,
            ChildRecord::new(id, &PostId::from(post), "someone"),
        )
    }

    #[test]
    fn test_subscribe_close() {
        let transport = LocalTransport::new();
        let scope = ScopeKey::CommentsOnPost(PostId::from("p1"));

        let mut handle = transport.subscribe(&scope).unwrap();
        assert_eq!(transport.subscriber_count(), 1);
        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            FeedMessage::Subscribed
        );

        handle.close().unwrap();
        assert_eq!(transport.subscriber_count(), 0);
        // Closing twice is fine.
        handle.close().unwrap();
    }

    #[test]
    fn test_publish_only_to_matching_scope() {
        let transport = LocalTransport::new();
        let p1 = transport
            .subscribe(&ScopeKey::CommentsOnPost(PostId::from("p1")))
            .unwrap();
        let p2 = transport
            .subscribe(&ScopeKey::CommentsOnPost(PostId::from("p2")))
            .unwrap();
        assert_eq!(p1.try_recv().unwrap(), FeedMessage::Subscribed);
        assert_eq!(p2.try_recv().unwrap(), FeedMessage::Subscribed);

        assert_eq!(transport.publish(comment_event("p1", "c1")), 1);

        assert!(matches!(p1.try_recv().unwrap(), FeedMessage::Change(_)));
        assert!(p2.try_recv().is_err());
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let transport = LocalTransport::with_buffer_size(2);
        let scope = ScopeKey::CommentsOnPost(PostId::from("p1"));
        let _handle = transport.subscribe(&scope).unwrap();

        for i in 0..10 {
            transport.publish(comment_event("p1", &format!("c{}", i)));
        }

        assert_eq!(transport.subscriber_count(), 0);
    }

    #[test]
    fn test_buffer_sized_from_config() {
        let mut config = SyncConfig::for_viewer("me");
        config.channel_buffer = 3;
        let transport = LocalTransport::from_config(&config);
        let scope = ScopeKey::CommentsOnPost(PostId::from("p1"));
        let _handle = transport.subscribe(&scope).unwrap();

        // The confirmation takes one slot.
        transport.publish(comment_event("p1", "c1"));
        transport.publish(comment_event("p1", "c2"));
        assert_eq!(transport.subscribers_on(&scope), 1);

        transport.publish(comment_event("p1", "c3"));
        assert_eq!(transport.subscribers_on(&scope), 0);
    }

    #[test]
    fn test_injected_open_failures() {
        let transport = LocalTransport::new();
        let scope = ScopeKey::ReactionsOnPost(PostId::from("p1"));
        transport.fail_next_opens(2);

        assert!(transport.subscribe(&scope).is_err());
        assert!(transport.subscribe(&scope).is_err());
        assert!(transport.subscribe(&scope).is_ok());
        assert_eq!(transport.open_calls(), 1);
    }
}
