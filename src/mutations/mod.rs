//! Optimistic mutations: local application, submission and settlement.
//!
//! A mutation moves through `Staged -> InFlight -> Acknowledged -> Confirmed`
//! and may be `Reverted` from any non-terminal state (rejection, exhausted
//! retries, timeout, conflict with authoritative data).

mod queue;
mod types;

pub use queue::OptimisticMutationQueue;
pub use types::{
    LocalValue, MutationId, MutationKind, MutationState, MutationSubmitter, MutationTarget,
    PendingMutation, Receipt, RevertReason, SubmitError, Submission,
};
