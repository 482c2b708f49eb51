//! Trigger evaluation: turn due schedule ticks into dispatch intents.
//!
//! Each pass reads every trigger, enumerates the ticks that fell due since
//! its watermark, and hands them to an [`IntentSink`] oldest first. The
//! watermark advances only after the sink settled a tick, so a crash
//! between handoff and advance replays the tick; the sink is expected to
//! treat the replay as a no-op. A tick the sink defers (someone else is
//! still working on it) stops the trigger's pass and is offered again on
//! the next one.

use pipegrid_state::{StateStore, Trigger, TriggerId};
use tracing::{debug, info, warn};

use crate::error::{TriggerError, TriggerResult};
use crate::schedule::TickSchedule;

/// Request to materialize the run for one (trigger, tick) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchIntent {
    pub trigger_id: TriggerId,
    pub tick: u64,
}

/// What the sink did with an intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handoff {
    /// The tick has a durable outcome, whether or not a run was created.
    Settled,
    /// The tick is not settled yet; offer it again later.
    Deferred,
}

/// Receiver of dispatch intents (the run coordinator).
pub trait IntentSink {
    type Error: std::error::Error + Send + Sync + 'static;

    fn hand_off(&self, intent: &DispatchIntent, now: u64) -> Result<Handoff, Self::Error>;
}

/// Summary of one evaluation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvaluationReport {
    pub triggers_evaluated: usize,
    pub intents_handed_off: usize,
    pub intents_deferred: usize,
    pub ticks_skipped: u64,
}

/// Result of evaluating one trigger.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TriggerPass {
    pub handed_off: usize,
    /// A tick was deferred; later ticks were not offered.
    pub deferred: bool,
    /// Ticks dropped by the catch-up bound.
    pub skipped: u64,
}

pub struct TriggerEvaluator {
    store: StateStore,
    max_catch_up_ticks: usize,
}

impl TriggerEvaluator {
    pub fn new(store: StateStore, max_catch_up_ticks: u32) -> Self {
        Self {
            store,
            max_catch_up_ticks: max_catch_up_ticks as usize,
        }
    }

    /// Evaluate every trigger once.
    ///
    /// A handoff failure aborts the pass; the affected tick stays behind
    /// the watermark and is offered again next pass.
    pub fn evaluate_all<S: IntentSink>(&self, sink: &S, now: u64) -> TriggerResult<EvaluationReport> {
        let mut report = EvaluationReport::default();
        for trigger in self.store.list_triggers()? {
            if !trigger.enabled {
                continue;
            }
            let pass = self.evaluate_trigger(&trigger, sink, now)?;
            report.triggers_evaluated += 1;
            report.intents_handed_off += pass.handed_off;
            report.intents_deferred += usize::from(pass.deferred);
            report.ticks_skipped += pass.skipped;
        }
        if report.intents_handed_off > 0 || report.ticks_skipped > 0 {
            info!(
                triggers = report.triggers_evaluated,
                intents = report.intents_handed_off,
                skipped = report.ticks_skipped,
                "trigger evaluation pass"
            );
        }
        Ok(report)
    }

    /// Evaluate one trigger.
    pub fn evaluate_trigger<S: IntentSink>(
        &self,
        trigger: &Trigger,
        sink: &S,
        now: u64,
    ) -> TriggerResult<TriggerPass> {
        let schedule = match TickSchedule::for_trigger(trigger) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(trigger = %trigger.id, error = %e, "trigger has an unusable schedule, skipping");
                return Ok(TriggerPass::default());
            }
        };

        let until = trigger.end_at.map_or(now, |end| end.min(now));
        let due = schedule.due_ticks(trigger.last_evaluated_tick, until, self.max_catch_up_ticks);

        if let Some(through) = due.skipped_through {
            warn!(
                trigger = %trigger.id,
                skipped = due.skipped,
                through,
                "catch-up bound exceeded, dropping older ticks"
            );
            self.store.advance_watermark(&trigger.id, through, due.skipped, now)?;
        }

        let mut pass = TriggerPass {
            skipped: due.skipped,
            ..TriggerPass::default()
        };
        for tick in due.ticks {
            let intent = DispatchIntent {
                trigger_id: trigger.id.clone(),
                tick,
            };
            let handoff = sink
                .hand_off(&intent, now)
                .map_err(|e| TriggerError::Handoff(Box::new(e)))?;
            if handoff == Handoff::Deferred {
                debug!(trigger = %trigger.id, tick, "tick deferred");
                pass.deferred = true;
                break;
            }
            self.store.advance_watermark(&trigger.id, tick, 0, now)?;
            pass.handed_off += 1;
            debug!(trigger = %trigger.id, tick, "tick handed off");
        }
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::fmt;

    use pipegrid_state::{ConcurrencyPolicy, Schedule, Variables};

    use super::*;

    #[derive(Debug)]
    struct Refused;

    impl fmt::Display for Refused {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("refused")
        }
    }

    impl std::error::Error for Refused {}

    /// Records intents; refuses ticks listed in `refuse` and defers
    /// those listed in `defer`.
    #[derive(Default)]
    struct RecordingSink {
        seen: RefCell<Vec<DispatchIntent>>,
        refuse: Vec<u64>,
        defer: Vec<u64>,
    }

    impl IntentSink for RecordingSink {
        type Error = Refused;

        fn hand_off(&self, intent: &DispatchIntent, _now: u64) -> Result<Handoff, Refused> {
            if self.refuse.contains(&intent.tick) {
                return Err(Refused);
            }
            if self.defer.contains(&intent.tick) {
                return Ok(Handoff::Deferred);
            }
            self.seen.borrow_mut().push(intent.clone());
            Ok(Handoff::Settled)
        }
    }

    impl RecordingSink {
        fn ticks(&self) -> Vec<u64> {
            self.seen.borrow().iter().map(|i| i.tick).collect()
        }
    }

    fn trigger(id: &str, schedule: Schedule) -> Trigger {
        Trigger {
            id: id.to_string(),
            pipeline_id: "etl".to_string(),
            schedule,
            start_at: 1000,
            end_at: None,
            concurrency: ConcurrencyPolicy::AllowOverlap,
            enabled: true,
            variables: Variables::new(),
            last_evaluated_tick: None,
            skipped_ticks: 0,
            created_at: 1000,
            updated_at: 1000,
        }
    }

    fn every_minute(id: &str) -> Trigger {
        trigger(id, Schedule::Interval { every_secs: 60 })
    }

    #[test]
    fn hands_off_due_ticks_and_advances_watermark() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_trigger(&every_minute("t")).unwrap();
        let evaluator = TriggerEvaluator::new(store.clone(), 5);
        let sink = RecordingSink::default();

        let report = evaluator.evaluate_all(&sink, 1130).unwrap();
        assert_eq!(report.intents_handed_off, 3);
        assert_eq!(sink.ticks(), vec![1000, 1060, 1120]);
        assert_eq!(store.get_trigger("t").unwrap().unwrap().last_evaluated_tick, Some(1120));

        // Same instant again: nothing new.
        let report = evaluator.evaluate_all(&sink, 1130).unwrap();
        assert_eq!(report.intents_handed_off, 0);
    }

    #[test]
    fn failed_handoff_keeps_tick_for_next_pass() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_trigger(&every_minute("t")).unwrap();
        let evaluator = TriggerEvaluator::new(store.clone(), 5);

        let flaky = RecordingSink { refuse: vec![1060], ..Default::default() };
        let err = evaluator.evaluate_all(&flaky, 1130).unwrap_err();
        assert!(matches!(err, TriggerError::Handoff(_)));
        assert_eq!(flaky.ticks(), vec![1000]);
        assert_eq!(store.get_trigger("t").unwrap().unwrap().last_evaluated_tick, Some(1000));

        let healthy = RecordingSink::default();
        evaluator.evaluate_all(&healthy, 1130).unwrap();
        assert_eq!(healthy.ticks(), vec![1060, 1120]);
    }

    #[test]
    fn deferred_tick_holds_the_watermark() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_trigger(&every_minute("t")).unwrap();
        let evaluator = TriggerEvaluator::new(store.clone(), 5);

        let busy = RecordingSink { defer: vec![1060], ..Default::default() };
        let report = evaluator.evaluate_all(&busy, 1130).unwrap();
        assert_eq!(report.intents_deferred, 1);
        assert_eq!(busy.ticks(), vec![1000]);
        assert_eq!(store.get_trigger("t").unwrap().unwrap().last_evaluated_tick, Some(1000));

        let free = RecordingSink::default();
        evaluator.evaluate_all(&free, 1130).unwrap();
        assert_eq!(free.ticks(), vec![1060, 1120]);
    }

    #[test]
    fn catch_up_is_bounded_and_counted() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_trigger(&every_minute("t")).unwrap();
        let evaluator = TriggerEvaluator::new(store.clone(), 2);
        let sink = RecordingSink::default();

        // Ticks 1000..=1540 are due after a long outage.
        let report = evaluator.evaluate_all(&sink, 1550).unwrap();
        assert_eq!(sink.ticks(), vec![1480, 1540]);
        assert_eq!(report.ticks_skipped, 8);

        let stored = store.get_trigger("t").unwrap().unwrap();
        assert_eq!(stored.skipped_ticks, 8);
        assert_eq!(stored.last_evaluated_tick, Some(1540));
    }

    #[test]
    fn disabled_and_expired_triggers_do_not_fire() {
        let store = StateStore::open_in_memory().unwrap();
        let mut disabled = every_minute("off");
        disabled.enabled = false;
        store.put_trigger(&disabled).unwrap();
        let mut ended = every_minute("ended");
        ended.end_at = Some(1070);
        store.put_trigger(&ended).unwrap();

        let evaluator = TriggerEvaluator::new(store.clone(), 5);
        let sink = RecordingSink::default();
        evaluator.evaluate_all(&sink, 2000).unwrap();

        let seen = sink.seen.borrow();
        assert!(seen.iter().all(|i| i.trigger_id == "ended"));
        assert_eq!(sink.ticks(), vec![1000, 1060]);
    }

    #[test]
    fn invalid_cron_is_skipped_not_fatal() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_trigger(&trigger("bad", Schedule::Cron { expression: "bogus".to_string() }))
            .unwrap();
        store.put_trigger(&every_minute("good")).unwrap();

        let evaluator = TriggerEvaluator::new(store, 5);
        let sink = RecordingSink::default();
        let report = evaluator.evaluate_all(&sink, 1000).unwrap();
        assert_eq!(report.intents_handed_off, 1);
    }
}
