//! Scheduler error types.

use thiserror::Error;

use crate::graph::GraphError;

/// Errors that can occur while driving pipeline runs.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("invalid pipeline definition: {0}")]
    Graph(#[from] GraphError),

    #[error("state store error: {0}")]
    State(#[from] pipegrid_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
