//! pipegrid-scheduler — the block DAG engine and the per-replica run driver.
//!
//! [`engine`] holds the pure state machine of a pipeline run and the
//! persisted [`DagEngine`] front-end. [`driver`] connects it to the executor
//! backends: it submits ready blocks, polls running ones and reports their
//! outcomes back.

pub mod driver;
pub mod engine;
pub mod error;
pub mod graph;
pub mod retry;
pub mod status;

pub use driver::{DriverReport, RunDriver};
pub use engine::{
    BlockOutcome, DagEngine, ReportOutcome, StatusReport, apply_cancel, apply_mark_running,
    apply_report, apply_start, finalize, is_halted, materialize_blocks, queue_ready,
};
pub use error::{SchedulerError, SchedulerResult};
pub use graph::{BlockGraph, GraphError, descendants};
pub use retry::RetryPolicy;
pub use status::derive_run_status;
