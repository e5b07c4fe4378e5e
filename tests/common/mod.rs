//! Fakes shared by the integration tests.

#![allow(dead_code)]

use feedsync::{
    Collaborators, Cursor, FeedSession, LocalTransport, ModerationGate, ModerationVerdict,
    MutationSubmitter, PageSource, Post, Receipt, SubmitError, Submission, SyncConfig, Timestamp,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const VIEWER: &str = "me";

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Post `p{i}` by `author{i % 3}` created at `i` seconds.
pub fn post(i: i64) -> Post {
    Post::new(
        format!("p{}", i),
        format!("author{}", i % 3),
        Timestamp(i * 1_000_000),
        format!("caption {}", i),
    )
}

/// Backend history served newest first through a keyset cursor.
pub struct FakePages {
    posts: Mutex<Vec<Post>>,
    /// Posts returned regardless of the cursor, to simulate overlapping windows.
    overlap: Mutex<Vec<Post>>,
    failures: Mutex<u32>,
    calls: AtomicU64,
}

impl FakePages {
    pub fn new(mut posts: Vec<Post>) -> Self {
        posts.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
        Self {
            posts: Mutex::new(posts),
            overlap: Mutex::new(Vec::new()),
            failures: Mutex::new(0),
            calls: AtomicU64::new(0),
        }
    }

    /// Posts `p1..=pn`.
    pub fn numbered(n: i64) -> Self {
        Self::new((1..=n).map(post).collect())
    }

    pub fn add(&self, post: Post) {
        let mut posts = self.posts.lock();
        posts.push(post);
        posts.sort_by(|a, b| b.order_key().cmp(&a.order_key()));
    }

    pub fn overlap_with(&self, post: Post) {
        self.overlap.lock().push(post);
    }

    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl PageSource for FakePages {
    fn fetch_posts(&self, cursor: &Cursor, limit: usize) -> Result<Vec<Post>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err("service unavailable".to_string());
            }
        }

        let mut page: Vec<Post> = self
            .posts
            .lock()
            .iter()
            .filter(|p| cursor.admits(p))
            .take(limit)
            .cloned()
            .collect();
        if !cursor.is_top() {
            page.extend(self.overlap.lock().drain(..));
        }
        Ok(page)
    }
}

/// Records submissions and answers from a script, defaulting to success.
pub struct FakeSubmitter {
    script: Mutex<VecDeque<Result<Receipt, SubmitError>>>,
    submitted: Mutex<Vec<Submission>>,
    version: AtomicU64,
}

impl FakeSubmitter {
    pub fn new() -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            submitted: Mutex::new(Vec::new()),
            version: AtomicU64::new(1),
        }
    }

    pub fn respond(&self, result: Result<Receipt, SubmitError>) {
        self.script.lock().push_back(result);
    }

    pub fn submitted(&self) -> Vec<Submission> {
        self.submitted.lock().clone()
    }
}

impl MutationSubmitter for FakeSubmitter {
    fn submit(&self, submission: &Submission) -> Result<Receipt, SubmitError> {
        self.submitted.lock().push(submission.clone());
        if let Some(result) = self.script.lock().pop_front() {
            return result;
        }
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        match submission {
            Submission::Comment { .. } => {
                Ok(Receipt::at(version).with_id(format!("srv-{}", version)))
            }
            _ => Ok(Receipt::at(version)),
        }
    }
}

/// Rejects text containing any blocked word, flags text containing "?!".
pub struct Blocklist(pub Vec<&'static str>);

impl ModerationGate for Blocklist {
    fn review(&self, text: &str) -> ModerationVerdict {
        if let Some(word) = self.0.iter().find(|w| text.contains(*w)) {
            return ModerationVerdict::Reject(format!("contains \"{}\"", word));
        }
        if text.contains("?!") {
            return ModerationVerdict::Flag;
        }
        ModerationVerdict::Allow
    }
}

pub struct Harness {
    pub session: FeedSession,
    pub transport: LocalTransport,
    pub pages: Arc<FakePages>,
    pub submitter: Arc<FakeSubmitter>,
}

pub fn config() -> SyncConfig {
    let mut config = SyncConfig::for_viewer(VIEWER);
    config.page_size = 5;
    config.retained_window = 5;
    config.mutation_timeout = Duration::from_secs(10);
    config
}

pub fn harness(pages: FakePages) -> Harness {
    harness_with(pages, config(), |c| c)
}

pub fn harness_with(
    pages: FakePages,
    config: SyncConfig,
    customize: impl FnOnce(Collaborators) -> Collaborators,
) -> Harness {
    init_tracing();
    let transport = LocalTransport::from_config(&config);
    let pages = Arc::new(pages);
    let submitter = Arc::new(FakeSubmitter::new());

    let collaborators = customize(Collaborators::new(
        Arc::new(transport.clone()),
        pages.clone(),
        submitter.clone(),
    ));
    let session = FeedSession::new(config, collaborators).unwrap();

    Harness {
        session,
        transport,
        pages,
        submitter,
    }
}
