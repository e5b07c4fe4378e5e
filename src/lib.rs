//! # feedsync
//!
//! State synchronization core for a social feed: a paginated list of posts
//! kept consistent with per-entity change feeds, with the viewer's own likes,
//! comments and follows applied optimistically on top.
//!
//! ## Core Concepts
//!
//! - **Change feeds**: ordered `Insert | Update | Delete` events per scope
//! - **Multiplexer**: opens exactly the scopes the visible feed needs
//! - **Feed store**: one record per post, stale events discarded, counters
//!   deduplicated, optimistic layers over authoritative state
//! - **Mutation queue**: staged, submitted, confirmed or reverted edits
//! - **Pagination**: keyset cursor over older history
//!
//! ## Example
//!
//! ```ignore
//! use feedsync::{Collaborators, FeedSession, LocalTransport, SyncConfig};
//!
//! let session = FeedSession::new(
//!     SyncConfig::for_viewer("me"),
//!     Collaborators::new(Arc::new(LocalTransport::new()), pages, submitter),
//! )?;
//!
//! session.load_initial(Instant::now())?;
//! session.like(&post_id, Instant::now())?;
//!
//! loop {
//!     session.pump(Instant::now());
//!     session.tick(Instant::now());
//!     render(session.snapshot());
//! }
//! ```

pub mod changefeed;
pub mod compose;
pub mod config;
pub mod error;
pub mod moderation;
pub mod mutations;
pub mod notice;
pub mod pagination;
pub mod session;
pub mod store;
pub mod subscriptions;
pub mod types;

// Re-exports
pub use changefeed::{
    decode_envelope, ChangeEvent, ChangeFeedTransport, ChangeOp, ChildRecord, DropReason,
    EntityKind, EntityRecord, FeedCloser, FeedHandle, FeedMessage, LocalTransport, ScopeKey,
};
pub use compose::{prepare_draft, CaptionGenerator, PostDraft, PostPublisher};
pub use config::{RetryPolicy, SyncConfig};
pub use error::{Result, SyncError};
pub use moderation::{AllowAll, ModerationGate, ModerationVerdict};
pub use mutations::{
    LocalValue, MutationId, MutationKind, MutationState, MutationSubmitter, MutationTarget,
    OptimisticMutationQueue, PendingMutation, Receipt, RevertReason, SubmitError, Submission,
};
pub use notice::Notice;
pub use pagination::{fetch_page, Cursor, PageOutcome, PageRequest, PageSource, PaginationCursor};
pub use session::{Collaborators, FeedSession};
pub use store::{ApplyOutcome, FeedStore, Origin, PageMerge, Resolution};
pub use subscriptions::{LifecycleState, MultiplexReport, ScopeStatus, SubscriptionMultiplexer};
pub use types::*;
