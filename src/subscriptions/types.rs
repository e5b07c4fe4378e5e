//! Subscription lifecycle types.

use crate::changefeed::{FeedHandle, ScopeKey};
use std::time::Instant;

/// Lifecycle of one change feed subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LifecycleState {
    /// Requested, waiting for the transport's confirmation.
    Opening,
    Active,
    /// Close requested but the transport has not released it yet.
    Closing,
    /// Nothing held for the scope: never opened, or closed and released.
    Closed,
}

/// Externally visible status of a scope.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScopeStatus {
    Live(LifecycleState),
    /// Open failed; another attempt is scheduled.
    Backoff { attempts: u32 },
    /// Retries exhausted. Data for the scope may be stale until the next
    /// recompute succeeds in reopening it.
    Degraded { attempts: u32 },
}

/// Scope transitions produced by one multiplexer operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MultiplexReport {
    pub opened: Vec<ScopeKey>,
    pub closed: Vec<ScopeKey>,
    /// Scopes that just ran out of open retries.
    pub degraded: Vec<ScopeKey>,
    /// Previously degraded scopes that opened again.
    pub recovered: Vec<ScopeKey>,
}

impl MultiplexReport {
    pub fn is_empty(&self) -> bool {
        self.opened.is_empty()
            && self.closed.is_empty()
            && self.degraded.is_empty()
            && self.recovered.is_empty()
    }
}

/// An open (or opening) subscription.
pub(crate) struct Subscription {
    pub handle: FeedHandle,
    pub state: LifecycleState,
}

/// Open failures for a scope that is desired but not open.
#[derive(Clone, Debug)]
pub(crate) struct Failure {
    pub attempts: u32,
    pub next_attempt_at: Instant,
    pub degraded: bool,
    pub last_error: String,
}
