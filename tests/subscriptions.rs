//! Subscription lifecycle through the session.

mod common;

use common::{config, harness, harness_with, FakePages};
use feedsync::{
    ChangeEvent, ChangeOp, ChildRecord, LifecycleState, Notice, PostId, RetryPolicy, ScopeKey,
    ScopeStatus,
};
use std::time::{Duration, Instant};

fn id(s: &str) -> PostId {
    PostId::from(s)
}

#[test]
fn test_subscription_count_follows_loaded_posts() {
    let h = harness(FakePages::numbered(10));
    let now = Instant::now();

    h.session.load_initial(now).unwrap();
    // p10..p6: three authors, two child scopes per post.
    assert_eq!(h.session.open_subscription_count(), 13);

    h.session.load_more(now).unwrap();
    assert_eq!(h.session.open_subscription_count(), 23);
    assert_eq!(h.transport.subscriber_count(), 23);

    // Reconciling again opens nothing new.
    let opens = h.transport.open_calls();
    assert!(h.session.sync_subscriptions(now).is_empty());
    assert_eq!(h.transport.open_calls(), opens);
}

#[test]
fn test_subscriptions_become_active_after_pump() {
    let h = harness(FakePages::numbered(1));
    let now = Instant::now();
    h.session.load_initial(now).unwrap();

    let scope = ScopeKey::CommentsOnPost(id("p1"));
    assert_eq!(
        h.session.subscription_status(&scope),
        ScopeStatus::Live(LifecycleState::Opening)
    );

    h.session.pump(now);
    assert_eq!(
        h.session.subscription_status(&scope),
        ScopeStatus::Live(LifecycleState::Active)
    );
}

#[test]
fn test_degraded_scope_marks_posts_stale_until_recovered() {
    let mut config = config();
    config.subscribe_retry = RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(1),
    };
    let h = harness_with(FakePages::numbered(1), config, |c| c);
    let now = Instant::now();

    // The author scope sorts first and takes the injected failure.
    h.transport.fail_next_opens(1);
    h.session.load_initial(now).unwrap();

    let scope = ScopeKey::PostsByAuthor("author1".into());
    assert_eq!(
        h.session.subscription_status(&scope),
        ScopeStatus::Degraded { attempts: 1 }
    );
    assert!(h.session.get(&id("p1")).unwrap().stale);
    assert_eq!(h.session.open_subscription_count(), 2);
    assert!(h.session.drain_notices().contains(&Notice::ScopeDegraded {
        scope: scope.clone()
    }));

    let report = h.session.sync_subscriptions(now + Duration::from_secs(1));
    assert_eq!(report.recovered, vec![scope.clone()]);
    assert!(!h.session.get(&id("p1")).unwrap().stale);
    assert_eq!(h.session.open_subscription_count(), 3);
    assert_eq!(
        h.session.drain_notices(),
        vec![Notice::ScopeRecovered { scope }]
    );
}

#[test]
fn test_slow_consumer_dropped_and_resubscribed() {
    let mut config = config();
    config.channel_buffer = 4;
    let h = harness_with(FakePages::numbered(1), config, |c| c);
    let now = Instant::now();
    h.session.load_initial(now).unwrap();

    let scope = ScopeKey::CommentsOnPost(id("p1"));
    for i in 0..10 {
        h.transport.publish(ChangeEvent::comment(
            ChangeOp::Insert,
            ChildRecord::new(format!("c{}", i), &id("p1"), "bob"),
        ));
    }
    assert_eq!(h.transport.subscribers_on(&scope), 0);

    // Confirmation plus three events fit in the buffer.
    h.session.pump(now);
    assert_eq!(h.session.get(&id("p1")).unwrap().post.comment_count, 3);
    assert!(matches!(
        h.session.subscription_status(&scope),
        ScopeStatus::Backoff { attempts: 1 }
    ));

    h.session.tick(now + Duration::from_millis(250));
    assert_eq!(h.transport.subscribers_on(&scope), 1);
}

#[test]
fn test_pending_close_blocks_reopen() {
    let h = harness(FakePages::numbered(2));
    let now = Instant::now();
    h.session.load_initial(now).unwrap();

    // p1's author scope sorts first among the scopes going away.
    let author = ScopeKey::PostsByAuthor("author1".into());
    h.transport.fail_next_closes(1);
    h.session.set_viewport(Some(vec![id("p2")]), now);

    assert_eq!(
        h.session.subscription_status(&author),
        ScopeStatus::Live(LifecycleState::Closing)
    );
    assert_eq!(h.transport.subscribers_on(&author), 1);
    assert_eq!(h.session.open_subscription_count(), 3);

    // Back on screen: the stuck close finishes before the scope reopens.
    let report = h.session.set_viewport(None, now);
    assert!(report.closed.contains(&author));
    assert!(report.opened.contains(&author));
    assert_eq!(h.transport.subscribers_on(&author), 1);
    assert_eq!(h.session.open_subscription_count(), 6);
}
