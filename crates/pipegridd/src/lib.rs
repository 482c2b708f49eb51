//! pipegridd — the pipegrid daemon.
//!
//! Assembles the subsystems into one process:
//! - State store (redb)
//! - Scheduler replicas (trigger evaluation, run coordination, run driving)
//! - Executor backends (local subprocesses; container and cluster jobs on the local pool)
//! - Autoscaler
//! - Coordination lease reaper
//!
//! Replicas in one process share nothing but the state store, exactly as
//! replicas in separate processes would.

pub mod convert;
pub mod daemon;
pub mod replica;

pub use convert::{apply_config, pipeline_def, trigger_from_config, validate_config};
pub use daemon::{DaemonOptions, run_daemon, standalone_dispatcher};
pub use replica::{Replica, ReplicaReport};
