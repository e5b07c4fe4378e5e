//! Feed store: canonical post cache, reconciliation and optimistic layers.
//!
//! Display state of a post is its authoritative base with every pending
//! optimistic layer applied on top, so reverting a mutation only drops its
//! layer and leaves whatever the change feeds delivered in the meantime.

mod feed_store;
mod types;

pub use feed_store::FeedStore;
pub use types::{ApplyOutcome, Origin, PageMerge, Resolution};
