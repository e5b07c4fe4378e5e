//! Keyset pagination over reverse-chronological history.

use crate::config::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::types::{Post, PostId, Timestamp};
use serde::{Deserialize, Serialize};
use std::thread;
use tracing::{debug, warn};

/// Position in the history: fetch posts strictly older than the last one seen.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub last_seen_timestamp: Option<Timestamp>,
    pub last_seen_id: Option<PostId>,
    pub page_size: usize,
}

impl Cursor {
    /// Cursor at the newest end of the history.
    pub fn top(page_size: usize) -> Self {
        Self {
            last_seen_timestamp: None,
            last_seen_id: None,
            page_size,
        }
    }

    pub fn is_top(&self) -> bool {
        self.last_seen_timestamp.is_none()
    }

    /// Whether `post` lies past this cursor, i.e. belongs to the next page.
    pub fn admits(&self, post: &Post) -> bool {
        match (&self.last_seen_timestamp, &self.last_seen_id) {
            (Some(ts), Some(id)) => post.order_key() < (*ts, id),
            _ => true,
        }
    }

    fn advanced_past(&self, post: &Post) -> Self {
        Self {
            last_seen_timestamp: Some(post.created_at),
            last_seen_id: Some(post.id.clone()),
            page_size: self.page_size,
        }
    }
}

/// Backend listing of posts, newest first.
pub trait PageSource: Send + Sync {
    /// Up to `limit` posts older than the cursor, in descending creation order.
    fn fetch_posts(&self, cursor: &Cursor, limit: usize) -> std::result::Result<Vec<Post>, String>;
}

/// A fetch captured at issue time.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub cursor: Cursor,
    pub generation: u64,
}

/// What to do with a completed fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageOutcome {
    /// Merge it; the cursor moved past it.
    Accepted { exhausted: bool },
    /// A refresh happened since the fetch was issued.
    Superseded,
    /// The cursor already moved past this request.
    Repeated,
}

/// Tracks how far back the feed has been loaded.
#[derive(Debug)]
pub struct PaginationCursor {
    cursor: Cursor,
    generation: u64,
    exhausted: bool,
}

impl PaginationCursor {
    pub fn new(page_size: usize) -> Self {
        Self {
            cursor: Cursor::top(page_size),
            generation: 0,
            exhausted: false,
        }
    }

    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// True once a short page showed there is no older history.
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Capture the next fetch, or `None` when the history is exhausted.
    pub fn begin(&self) -> Option<PageRequest> {
        if self.exhausted {
            return None;
        }
        Some(PageRequest {
            cursor: self.cursor.clone(),
            generation: self.generation,
        })
    }

    /// Rewind to the top and invalidate every fetch issued before.
    pub fn refresh(&mut self) -> PageRequest {
        self.generation += 1;
        self.cursor = Cursor::top(self.cursor.page_size);
        self.exhausted = false;
        PageRequest {
            cursor: self.cursor.clone(),
            generation: self.generation,
        }
    }

    /// Record a successful fetch. Failed fetches never reach here, so the
    /// cursor only moves on success.
    pub fn complete(&mut self, request: &PageRequest, page: &[Post]) -> PageOutcome {
        if request.generation != self.generation {
            debug!(
                issued = request.generation,
                current = self.generation,
                "discarding superseded page"
            );
            return PageOutcome::Superseded;
        }
        if request.cursor != self.cursor {
            debug!(cursor = ?request.cursor, "page already merged");
            return PageOutcome::Repeated;
        }

        if let Some(oldest) = page.iter().min_by(|a, b| a.order_key().cmp(&b.order_key())) {
            self.cursor = self.cursor.advanced_past(oldest);
        }
        if page.len() < self.cursor.page_size {
            self.exhausted = true;
        }
        PageOutcome::Accepted {
            exhausted: self.exhausted,
        }
    }
}

/// Fetch one page, retrying transport failures per `retry`.
pub fn fetch_page(
    source: &dyn PageSource,
    request: &PageRequest,
    retry: &RetryPolicy,
) -> Result<Vec<Post>> {
    let mut failures = 0;
    loop {
        match source.fetch_posts(&request.cursor, request.cursor.page_size) {
            Ok(page) => return Ok(page),
            Err(reason) => {
                failures += 1;
                if !retry.allows_retry(failures) {
                    return Err(SyncError::Transport(reason));
                }
                let delay = retry.backoff(failures);
                warn!(attempt = failures, ?delay, error = %reason, "page fetch failed, retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        }
    }
}
