//! pipegrid-trigger — schedule evaluation.
//!
//! Enumerates the ticks of interval and cron triggers, bounds catch-up
//! after downtime, and hands due ticks to the run coordinator through
//! the [`IntentSink`] trait.

pub mod error;
pub mod evaluator;
pub mod schedule;

pub use error::{TriggerError, TriggerResult};
pub use evaluator::{DispatchIntent, EvaluationReport, Handoff, IntentSink, TriggerEvaluator, TriggerPass};
pub use schedule::{DueTicks, ScheduleError, TickSchedule, validate_cron};
