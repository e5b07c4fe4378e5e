//! Keeps the set of open change feeds equal to the set the feed needs.

use super::types::{Failure, LifecycleState, MultiplexReport, ScopeStatus, Subscription};
use crate::changefeed::{
    ChangeEvent, ChangeFeedTransport, DropReason, FeedHandle, FeedMessage, ScopeKey,
};
use crate::config::RetryPolicy;
use crossbeam_channel::TryRecvError;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Opens, closes and drains change feeds for a desired scope set.
///
/// Invariants after every operation:
/// - at most one subscription per scope;
/// - a scope whose close has not completed is never reopened;
/// - every desired scope is open, backing off, or degraded.
pub struct SubscriptionMultiplexer {
    transport: Arc<dyn ChangeFeedTransport>,
    retry: RetryPolicy,
    desired: BTreeSet<ScopeKey>,
    subscriptions: BTreeMap<ScopeKey, Subscription>,
    /// Handles whose transport close failed; retried before any reopen.
    closing: BTreeMap<ScopeKey, FeedHandle>,
    failed: BTreeMap<ScopeKey, Failure>,
}

impl SubscriptionMultiplexer {
    pub fn new(transport: Arc<dyn ChangeFeedTransport>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            retry,
            desired: BTreeSet::new(),
            subscriptions: BTreeMap::new(),
            closing: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    /// Diff `desired` against what is open: close extras, open what is missing.
    ///
    /// Degraded scopes get a fresh attempt here. Scopes still backing off wait
    /// for [`tick`](Self::tick).
    pub fn reconcile(&mut self, desired: BTreeSet<ScopeKey>, now: Instant) -> MultiplexReport {
        let mut report = MultiplexReport::default();
        self.desired = desired;
        self.retry_closing(&mut report);

        let extra: Vec<ScopeKey> = self
            .subscriptions
            .keys()
            .filter(|scope| !self.desired.contains(*scope))
            .cloned()
            .collect();
        for scope in extra {
            if let Some(sub) = self.subscriptions.remove(&scope) {
                self.close_handle(scope, sub.handle, &mut report);
            }
        }
        self.failed.retain(|scope, _| self.desired.contains(scope));

        let missing: Vec<ScopeKey> = self
            .desired
            .iter()
            .filter(|scope| !self.subscriptions.contains_key(*scope))
            .filter(|scope| !self.closing.contains_key(*scope))
            .filter(|scope| {
                self.failed
                    .get(*scope)
                    .map_or(true, |f| f.degraded || f.next_attempt_at <= now)
            })
            .cloned()
            .collect();
        for scope in missing {
            self.open(scope, now, &mut report);
        }

        if !report.is_empty() {
            debug!(
                opened = report.opened.len(),
                closed = report.closed.len(),
                open = self.subscriptions.len(),
                "subscriptions reconciled"
            );
        }
        report
    }

    /// Run due work: pending closes and open retries whose backoff elapsed.
    pub fn tick(&mut self, now: Instant) -> MultiplexReport {
        let mut report = MultiplexReport::default();
        self.retry_closing(&mut report);

        let due: Vec<ScopeKey> = self
            .failed
            .iter()
            .filter(|(_, f)| !f.degraded && f.next_attempt_at <= now)
            .map(|(scope, _)| scope.clone())
            .filter(|scope| self.desired.contains(scope))
            .filter(|scope| !self.subscriptions.contains_key(scope))
            .filter(|scope| !self.closing.contains_key(scope))
            .collect();
        for scope in due {
            self.open(scope, now, &mut report);
        }
        report
    }

    /// Collect every buffered change event, each channel in delivery order.
    ///
    /// Confirmations move subscriptions to `Active`. A channel the transport
    /// dropped re-enters the open retry path if its scope is still desired.
    pub fn drain(&mut self, now: Instant) -> (Vec<ChangeEvent>, MultiplexReport) {
        let mut events = Vec::new();
        let mut dropped = Vec::new();

        for (scope, sub) in self.subscriptions.iter_mut() {
            loop {
                match sub.handle.try_recv() {
                    Ok(FeedMessage::Subscribed) => {
                        if sub.state == LifecycleState::Opening {
                            info!(scope = %scope, "subscription active");
                        }
                        sub.state = LifecycleState::Active;
                    }
                    Ok(FeedMessage::Change(event)) => events.push(event),
                    Ok(FeedMessage::Dropped { reason }) => {
                        dropped.push((scope.clone(), reason));
                        break;
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        dropped.push((
                            scope.clone(),
                            DropReason::Error("channel disconnected".to_string()),
                        ));
                        break;
                    }
                }
            }
        }

        let mut report = MultiplexReport::default();
        for (scope, reason) in dropped {
            let Some(mut sub) = self.subscriptions.remove(&scope) else {
                continue;
            };
            // Release whatever the transport still holds for it.
            if let Err(e) = sub.handle.close() {
                debug!(scope = %scope, error = %e, "close after drop failed");
            }
            report.closed.push(scope.clone());

            match reason {
                DropReason::Unsubscribed => {
                    info!(scope = %scope, "subscription ended by transport");
                }
                reason => {
                    warn!(scope = %scope, ?reason, "subscription dropped");
                    if self.desired.contains(&scope) {
                        self.record_failure(scope, format!("{:?}", reason), now, &mut report);
                    }
                }
            }
        }
        (events, report)
    }

    /// Close `scopes` right away and stop wanting them, e.g. after the post
    /// they belong to was deleted.
    pub fn close_scopes(&mut self, scopes: &[ScopeKey]) -> MultiplexReport {
        let mut report = MultiplexReport::default();
        for scope in scopes {
            self.desired.remove(scope);
            self.failed.remove(scope);
            if let Some(sub) = self.subscriptions.remove(scope) {
                self.close_handle(scope.clone(), sub.handle, &mut report);
            }
        }
        report
    }

    /// Close everything.
    pub fn close_all(&mut self) -> MultiplexReport {
        let mut report = MultiplexReport::default();
        self.desired.clear();
        self.failed.clear();
        let subscriptions = std::mem::take(&mut self.subscriptions);
        for (scope, sub) in subscriptions {
            self.close_handle(scope, sub.handle, &mut report);
        }
        self.retry_closing(&mut report);
        report
    }

    fn open(&mut self, scope: ScopeKey, now: Instant, report: &mut MultiplexReport) {
        match self.transport.subscribe(&scope) {
            Ok(handle) => {
                if let Some(failure) = self.failed.remove(&scope) {
                    if failure.degraded {
                        info!(scope = %scope, attempts = failure.attempts, "scope recovered");
                        report.recovered.push(scope.clone());
                    }
                }
                self.subscriptions.insert(
                    scope.clone(),
                    Subscription {
                        handle,
                        state: LifecycleState::Opening,
                    },
                );
                report.opened.push(scope);
            }
            Err(e) => self.record_failure(scope, e.to_string(), now, report),
        }
    }

    fn record_failure(
        &mut self,
        scope: ScopeKey,
        error: String,
        now: Instant,
        report: &mut MultiplexReport,
    ) {
        let failure = self.failed.entry(scope.clone()).or_insert(Failure {
            attempts: 0,
            next_attempt_at: now,
            degraded: false,
            last_error: String::new(),
        });
        failure.attempts += 1;
        failure.last_error = error;

        if self.retry.allows_retry(failure.attempts) {
            let delay = self.retry.backoff(failure.attempts);
            failure.next_attempt_at = now + delay;
            debug!(
                scope = %scope,
                attempt = failure.attempts,
                ?delay,
                error = %failure.last_error,
                "subscription open failed, backing off"
            );
        } else if !failure.degraded {
            failure.degraded = true;
            warn!(
                scope = %scope,
                attempts = failure.attempts,
                error = %failure.last_error,
                "scope degraded"
            );
            report.degraded.push(scope);
        }
    }

    fn close_handle(&mut self, scope: ScopeKey, mut handle: FeedHandle, report: &mut MultiplexReport) {
        match handle.close() {
            Ok(()) => report.closed.push(scope),
            Err(e) => {
                warn!(scope = %scope, error = %e, "subscription close failed, will retry");
                self.closing.insert(scope, handle);
            }
        }
    }

    fn retry_closing(&mut self, report: &mut MultiplexReport) {
        let closing = std::mem::take(&mut self.closing);
        for (scope, handle) in closing {
            self.close_handle(scope, handle, report);
        }
    }

    // --- Queries ---

    /// Subscriptions that are opening or active.
    pub fn open_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn active_count(&self) -> usize {
        self.subscriptions
            .values()
            .filter(|s| s.state == LifecycleState::Active)
            .count()
    }

    pub fn closing_count(&self) -> usize {
        self.closing.len()
    }

    pub fn open_scopes(&self) -> Vec<ScopeKey> {
        self.subscriptions.keys().cloned().collect()
    }

    pub fn desired(&self) -> &BTreeSet<ScopeKey> {
        &self.desired
    }

    pub fn degraded_scopes(&self) -> Vec<ScopeKey> {
        self.failed
            .iter()
            .filter(|(_, f)| f.degraded)
            .map(|(scope, _)| scope.clone())
            .collect()
    }

    /// Status of one scope; `Closed` when nothing is held for it.
    pub fn status(&self, scope: &ScopeKey) -> ScopeStatus {
        if let Some(sub) = self.subscriptions.get(scope) {
            return ScopeStatus::Live(sub.state);
        }
        if self.closing.contains_key(scope) {
            return ScopeStatus::Live(LifecycleState::Closing);
        }
        match self.failed.get(scope) {
            Some(f) if f.degraded => ScopeStatus::Degraded {
                attempts: f.attempts,
            },
            Some(f) => ScopeStatus::Backoff {
                attempts: f.attempts,
            },
            None => ScopeStatus::Live(LifecycleState::Closed),
        }
    }
}
