//! Subscription multiplexing over change feeds.
//!
//! The feed needs one change feed per visible post scope. The multiplexer
//! keeps the open set equal to that desired set:
//! - missing scopes are opened, with exponential backoff on failure;
//! - scopes no longer wanted are closed, and a scope whose close is still
//!   pending is not reopened;
//! - a scope that keeps failing is reported degraded and retried on the
//!   next recompute.
//!
//! # Example
//!
//! ```ignore
//! let mut mux = SubscriptionMultiplexer::new(Arc::new(transport), RetryPolicy::default());
//! mux.reconcile(store.desired_scopes(None), Instant::now());
//!
//! let (events, report) = mux.drain(Instant::now());
//! for event in events {
//!     store.apply_change_event(&event);
//! }
//! ```

mod multiplexer;
mod types;

pub use multiplexer::SubscriptionMultiplexer;
pub use types::{LifecycleState, MultiplexReport, ScopeStatus};
