//! Change feeds: push-style notification channels keyed by entity scope.
//!
//! A change feed delivers ordered `Insert | Update | Delete` events for one
//! scope:
//! - `posts-by-author:{id}`
//! - `comments-on-post:{id}`
//! - `reactions-on-post:{id}`
//!
//! Events on one feed arrive in emission order; nothing is guaranteed across
//! feeds.
//!
//! # Example
//!
//! ```ignore
//! let transport = LocalTransport::new();
//! let mut handle = transport.subscribe(&"comments-on-post:p1".parse()?)?;
//!
//! loop {
//!     match handle.try_recv() {
//!         Ok(FeedMessage::Subscribed) => println!("confirmed"),
//!         Ok(FeedMessage::Change(event)) => println!("{:?}", event),
//!         Ok(FeedMessage::Dropped { reason }) => break,
//!         Err(_) => break,
//!     }
//! }
//! ```

mod local;
mod transport;
mod types;

pub use local::LocalTransport;
pub use transport::{ChangeFeedTransport, FeedCloser, FeedHandle};
pub use types::{
    decode_envelope, ChangeEvent, ChangeOp, ChildRecord, DropReason, EntityKind, EntityRecord,
    FeedMessage, ScopeKey,
};
