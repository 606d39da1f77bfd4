//! Optimistic Module
//!
//! Local-first mutations reconciled against the REST endpoints.

pub mod api;
pub mod coordinator;
pub mod reaction;

pub use api::MutationApi;
pub use coordinator::{
    ApplyOutcome, MutationCoordinator, MutationKey, MutationKind, MutationStatus, OptimisticMutation,
};
pub use reaction::{Reaction, Trust};
