//! Transport abstraction for change feeds.

use super::types::{FeedMessage, ScopeKey};
use crate::error::Result;
use crossbeam_channel::{Receiver, RecvTimeoutError, TryRecvError};
use std::fmt;
use std::time::Duration;

/// A push-style change notification backend.
///
/// `subscribe` returns once the request is issued; the transport confirms the
/// subscription by sending [`FeedMessage::Subscribed`] on the handle.
pub trait ChangeFeedTransport: Send + Sync {
    fn subscribe(&self, scope: &ScopeKey) -> Result<FeedHandle>;
}

/// Transport-side teardown of one subscription.
pub trait FeedCloser: Send {
    /// Release the channel on the transport. May be retried after an error;
    /// must be idempotent once it has succeeded.
    fn close(&mut self) -> Result<()>;
}

/// One open change feed: its ordered message stream plus its close hook.
pub struct FeedHandle {
    scope: ScopeKey,
    receiver: Receiver<FeedMessage>,
    closer: Box<dyn FeedCloser>,
}

impl FeedHandle {
    pub fn new(scope: ScopeKey, receiver: Receiver<FeedMessage>, closer: Box<dyn FeedCloser>) -> Self {
        Self {
            scope,
            receiver,
            closer,
        }
    }

    pub fn scope(&self) -> &ScopeKey {
        &self.scope
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> std::result::Result<FeedMessage, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> std::result::Result<FeedMessage, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Close the feed on the transport.
    pub fn close(&mut self) -> Result<()> {
        self.closer.close()
    }
}

impl fmt::Debug for FeedHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FeedHandle")
            .field("scope", &self.scope)
            .field("buffered", &self.receiver.len())
            .finish()
    }
}
