//! pipegrid-state — embedded state store for pipegrid.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for triggers, pipeline definitions, runs, block runs, tick outcomes
//! and coordination leases.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{run_id}:{block_id}`, `{trigger_id}@{tick}`) enable
//! prefix scans for related records.
//!
//! Every scheduler replica holds a clone of one [`StateStore`]; it is the
//! only state the replicas share.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
