//! pipegrid-core — configuration model and shared helpers.
//!
//! Leaf crate: every other pipegrid crate depends on it, it depends on none.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod duration;
pub mod types;

pub use backoff::{exponential_delay, exponential_delay_secs};
pub use clock::epoch_secs;
pub use config::{
    AutoscaleSettings, BlockConfig, ExecutorSettings, PipegridConfig, PipelineConfig,
    RetrySettings, SchedulerSettings, TriggerConfig,
};
pub use duration::{DurationError, parse_duration, parse_duration_secs};
pub use types::{ConcurrencyPolicy, ExecutorKind, FailurePolicy};
