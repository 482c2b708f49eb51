//! Tick enumeration for interval and cron schedules.
//!
//! Cron expressions may be standard 5-field Unix expressions (minute, hour,
//! day-of-month, month, day-of-week) or 6-field expressions with seconds.
//! 5-field expressions are normalized to fire at second 0.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use pipegrid_state::{Schedule, Trigger};
use thiserror::Error;

/// Upper bound on dropped cron occurrences counted in one evaluation. Older
/// ones are still skipped, just not counted.
pub const CRON_SCAN_LIMIT: u64 = 10_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("invalid cron expression '{expression}': {reason}")]
    InvalidCron { expression: String, reason: String },

    #[error("interval must be at least one second")]
    ZeroInterval,
}

/// Prepend a seconds field to 5-field Unix expressions.
fn normalize_cron_expr(expression: &str) -> String {
    if expression.split_whitespace().count() == 5 {
        format!("0 {expression}")
    } else {
        expression.to_string()
    }
}

/// Check that a cron expression parses.
pub fn validate_cron(expression: &str) -> Result<(), ScheduleError> {
    parse_cron(expression).map(|_| ())
}

fn parse_cron(expression: &str) -> Result<cron::Schedule, ScheduleError> {
    cron::Schedule::from_str(&normalize_cron_expr(expression)).map_err(|e| {
        ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason: e.to_string(),
        }
    })
}

/// Ticks that fell due in one evaluation window.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DueTicks {
    /// Ticks to hand off, oldest first.
    pub ticks: Vec<u64>,
    /// Older due ticks dropped by the catch-up bound.
    pub skipped: u64,
    /// Latest dropped tick; the watermark jumps here before handoff.
    pub skipped_through: Option<u64>,
}

/// A trigger's schedule, parsed and anchored at its `start_at`.
#[derive(Debug, Clone)]
pub enum TickSchedule {
    Interval { start: u64, every: u64 },
    Cron { start: u64, schedule: Box<cron::Schedule> },
}

impl TickSchedule {
    pub fn for_trigger(trigger: &Trigger) -> Result<Self, ScheduleError> {
        match &trigger.schedule {
            Schedule::Interval { every_secs: 0 } => Err(ScheduleError::ZeroInterval),
            Schedule::Interval { every_secs } => Ok(Self::Interval {
                start: trigger.start_at,
                every: *every_secs,
            }),
            Schedule::Cron { expression } => Ok(Self::Cron {
                start: trigger.start_at,
                schedule: Box::new(parse_cron(expression)?),
            }),
        }
    }

    /// Ticks strictly after `watermark` (or at/after the start when there is
    /// none) and at or before `until`. At most `max_emit` of the most recent
    /// ones are returned; the rest are counted as skipped.
    pub fn due_ticks(&self, watermark: Option<u64>, until: u64, max_emit: usize) -> DueTicks {
        let max_emit = max_emit.max(1);
        match self {
            Self::Interval { start, every } => interval_due(*start, *every, watermark, until, max_emit),
            Self::Cron { start, schedule } => cron_due(schedule, *start, watermark, until, max_emit),
        }
    }
}

fn interval_due(start: u64, every: u64, watermark: Option<u64>, until: u64, max_emit: usize) -> DueTicks {
    if until < start {
        return DueTicks::default();
    }
    // Index of the first tick after the watermark.
    let first = match watermark {
        Some(w) if w >= start => (w - start) / every + 1,
        _ => 0,
    };
    let last = (until - start) / every;
    if first > last {
        return DueTicks::default();
    }

    let total = last - first + 1;
    let emit = total.min(max_emit as u64);
    let skipped = total - emit;
    let emit_from = last + 1 - emit;
    DueTicks {
        ticks: (emit_from..=last).map(|k| start + k * every).collect(),
        skipped,
        skipped_through: (skipped > 0).then(|| start + (emit_from - 1) * every),
    }
}

fn cron_due(
    schedule: &cron::Schedule,
    start: u64,
    watermark: Option<u64>,
    until: u64,
    max_emit: usize,
) -> DueTicks {
    // Ticks strictly after `from` are due.
    let from = match watermark {
        Some(w) => w.max(start.saturating_sub(1)),
        None => start.saturating_sub(1),
    };
    if until <= from {
        return DueTicks::default();
    }

    // Walk backwards from `until`: the newest ticks are emitted, the next
    // older one is where the watermark jumps to.
    let Some(until_dt) = i64::try_from(until)
        .ok()
        .and_then(|u| DateTime::<Utc>::from_timestamp(u.saturating_add(1), 0))
    else {
        return DueTicks::default();
    };
    let mut newest_first = Vec::with_capacity(max_emit);
    let mut due = DueTicks::default();
    for occurrence in schedule.after(&until_dt).rev() {
        let Ok(tick) = u64::try_from(occurrence.timestamp()) else {
            break;
        };
        if tick <= from {
            break;
        }
        if newest_first.len() < max_emit {
            newest_first.push(tick);
            continue;
        }
        if due.skipped_through.is_none() {
            due.skipped_through = Some(tick);
        }
        due.skipped += 1;
        if due.skipped >= CRON_SCAN_LIMIT {
            break;
        }
    }
    newest_first.reverse();
    due.ticks = newest_first;
    due
}
