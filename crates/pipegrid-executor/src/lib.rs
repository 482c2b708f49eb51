//! pipegrid-executor — pluggable job backends.
//!
//! Block attempts are dispatched through the [`Executor`] capability trait
//! to one of three backends:
//!
//! - [`LocalExecutor`]: `sh -c` subprocesses on the scheduler host
//! - [`ContainerJobExecutor`]: container jobs with native name de-duplication
//! - [`ClusterJobExecutor`]: cluster steps, de-duplicated by an existence check
//!
//! Submission is idempotent per `{run_id}:{block_id}:{attempt}`. Transient
//! backend errors are absorbed by [`BackoffTracker`] until a threshold, at
//! which point the caller fails the block.

pub mod backoff;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod local;
pub mod remote;

pub use backoff::{BackoffTracker, BackoffVerdict};
pub use dispatcher::Dispatcher;
pub use error::{ExecutorError, ExecutorResult};
pub use executor::{BoxFuture, Executor, JobStatus, SubmitRequest};
pub use local::{DEFAULT_JOB_RETENTION, LocalExecutor};
pub use remote::{
    ClusterJobExecutor, ContainerJobExecutor, CreateOutcome, InMemoryControlPlane, JobControlPlane,
    JobSpec, ProcessControlPlane, job_name,
};
