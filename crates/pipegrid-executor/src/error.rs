use pipegrid_state::ExecutorKind;
use thiserror::Error;

pub type ExecutorResult<T> = Result<T, ExecutorError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExecutorError {
    /// Backend unreachable or overloaded; the call may be retried.
    #[error("backend unavailable: {0}")]
    Transient(String),

    /// The backend refused the job for good.
    #[error("submission rejected: {0}")]
    Rejected(String),

    #[error("no executor registered for '{0}'")]
    NoBackend(ExecutorKind),
}

impl ExecutorError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
