//! Coordinator error types.

use thiserror::Error;

/// Errors that abort a dispatch. Losing a race is not one of them.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    State(#[from] pipegrid_state::StateError),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
