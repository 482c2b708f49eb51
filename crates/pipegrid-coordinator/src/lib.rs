//! pipegrid-coordinator — turns dispatch intents into pipeline runs.
//!
//! Many replicas may receive the same (trigger, tick) intent. The
//! [`RunCoordinator`] makes sure exactly one of them materializes a run:
//! a time-bounded lease in the state store settles the race, and the
//! store's atomic run insert backs it up.

pub mod coordinator;
pub mod error;

pub use coordinator::{DispatchOutcome, ManualRunRequest, RunCoordinator, SkipReason, lease_key};
pub use error::{CoordinatorError, CoordinatorResult};
