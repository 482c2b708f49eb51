use pipegrid_state::StateError;
use thiserror::Error;

pub type TriggerResult<T> = Result<T, TriggerError>;

#[derive(Debug, Error)]
pub enum TriggerError {
    #[error(transparent)]
    State(#[from] StateError),

    #[error("intent handoff failed: {0}")]
    Handoff(#[source] Box<dyn std::error::Error + Send + Sync>),
}
