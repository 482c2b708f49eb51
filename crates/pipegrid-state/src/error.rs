//! State store errors.

use thiserror::Error;

pub type StateResult<T> = Result<T, StateError>;

/// The store itself misbehaved.
///
/// Scheduling conflicts such as a taken tick or a lease held by another
/// replica are not errors; they come back as ordinary return values.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("cannot open state database: {0}")]
    Open(String),

    #[error("state transaction failed: {0}")]
    Transaction(String),

    #[error("cannot open state table: {0}")]
    Table(String),

    /// A redb read or write inside an open table failed.
    #[error("state storage failure: {0}")]
    Storage(String),

    #[error("cannot encode record: {0}")]
    Encode(String),

    #[error("corrupt record: {0}")]
    Decode(String),

    #[error("run '{0}' does not exist")]
    RunNotFound(String),
}
