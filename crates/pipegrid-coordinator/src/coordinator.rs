//! Exactly-once run creation per (trigger, tick).
//!
//! `try_dispatch` is safe to call from any number of replicas for the same
//! intent. The cheap checks come first: a disabled trigger, a busy trigger
//! under `skip_if_running`, a tick that already has an outcome. Then the
//! replica contends for the (trigger, tick) lease. The winner validates the
//! pipeline, materializes the run and inserts it in one transaction that
//! also records the tick, so a lease that expired mid-dispatch still cannot
//! produce a second run.

use chrono::{DateTime, SecondsFormat};
use pipegrid_scheduler::materialize_blocks;
use pipegrid_state::{
    ConcurrencyPolicy, InsertOutcome, PipelineDef, PipelineRun, PipelineRunStatus, RunId,
    StateError, StateStore, Trigger, TriggerId, Variables,
};
use pipegrid_trigger::{DispatchIntent, Handoff, IntentSink};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoordinatorResult;

/// Lease key of a (trigger, tick) pair.
pub fn lease_key(trigger_id: &str, tick: u64) -> String {
    format!("tick:{}", pipegrid_state::tick_key(trigger_id, tick))
}

/// Why a tick (or manual request) produced no run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    TriggerDisabled,
    AlreadyRunning,
    InvalidDefinition(String),
}

impl SkipReason {
    fn as_record(&self) -> String {
        match self {
            Self::TriggerDisabled => "trigger_disabled".to_string(),
            Self::AlreadyRunning => "already_running".to_string(),
            Self::InvalidDefinition(reason) => format!("invalid_definition: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Created(RunId),
    /// Another replica owns or already settled this tick.
    AlreadyClaimed,
    Skipped(SkipReason),
}

/// Ad-hoc run of a pipeline, optionally on behalf of a trigger.
#[derive(Debug, Clone, Default)]
pub struct ManualRunRequest {
    pub pipeline_id: String,
    /// When set, the trigger's variables and concurrency policy apply.
    pub trigger_id: Option<TriggerId>,
    /// Overrides merged over the trigger's variables.
    pub variables: Variables,
}

#[derive(Clone)]
pub struct RunCoordinator {
    store: StateStore,
    holder: String,
    lease_ttl_secs: u64,
}

impl RunCoordinator {
    pub fn new(store: StateStore, holder: impl Into<String>, lease_ttl_secs: u64) -> Self {
        Self {
            store,
            holder: holder.into(),
            lease_ttl_secs: lease_ttl_secs.max(1),
        }
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn try_dispatch(&self, intent: &DispatchIntent, now: u64) -> CoordinatorResult<DispatchOutcome> {
        let (trigger_id, tick) = (intent.trigger_id.as_str(), intent.tick);

        let trigger = match self.store.get_trigger(trigger_id)? {
            Some(t) if t.enabled => t,
            _ => {
                debug!(trigger = %trigger_id, tick, "trigger missing or disabled");
                return Ok(DispatchOutcome::Skipped(SkipReason::TriggerDisabled));
            }
        };

        let exclusive = trigger.concurrency == ConcurrencyPolicy::SkipIfRunning;
        if exclusive && self.store.has_active_run(trigger_id)? {
            return Ok(self.skip(trigger_id, tick, SkipReason::AlreadyRunning)?);
        }

        if self.store.get_tick(trigger_id, tick)?.is_some() {
            return Ok(DispatchOutcome::AlreadyClaimed);
        }

        let key = lease_key(trigger_id, tick);
        if self
            .store
            .try_acquire_lease(&key, &self.holder, now, self.lease_ttl_secs)?
            .is_none()
        {
            debug!(trigger = %trigger_id, tick, holder = %self.holder, "tick lease held elsewhere");
            return Ok(DispatchOutcome::AlreadyClaimed);
        }

        match self.create_for_tick(&trigger, tick, &key, exclusive, now) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Free the tick for another replica before giving up.
                if let Err(release) = self.store.release_lease(&key, &self.holder) {
                    warn!(%key, error = %release, "lease release failed");
                }
                Err(e.into())
            }
        }
    }

    fn create_for_tick(
        &self,
        trigger: &Trigger,
        tick: u64,
        key: &str,
        exclusive: bool,
        now: u64,
    ) -> Result<DispatchOutcome, StateError> {
        let pipeline = match self.resolve_pipeline(&trigger.pipeline_id)? {
            Ok(p) => p,
            Err(reason) => return self.skip(&trigger.id, tick, SkipReason::InvalidDefinition(reason)),
        };

        let mut variables = trigger.variables.clone();
        variables.insert("trigger_id".to_string(), trigger.id.clone().into());
        if let Some(at) = DateTime::from_timestamp(tick as i64, 0) {
            let stamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
            variables.insert("execution_date".to_string(), stamp.into());
        }

        let run = new_run(&pipeline, Some((trigger.id.clone(), tick)), variables, now);
        let blocks = match materialize_blocks(&pipeline, &run.id, now) {
            Ok(blocks) => blocks,
            Err(e) => return self.skip(&trigger.id, tick, SkipReason::InvalidDefinition(e.to_string())),
        };

        if !self.store.renew_lease(key, &self.holder, now, self.lease_ttl_secs)? {
            warn!(%key, holder = %self.holder, "tick lease lost before insert");
            return Ok(DispatchOutcome::AlreadyClaimed);
        }

        match self.store.insert_run(&run, &blocks, exclusive)? {
            InsertOutcome::Inserted => {
                info!(
                    run = %run.id,
                    trigger = %trigger.id,
                    pipeline = %pipeline.id,
                    tick,
                    blocks = blocks.len(),
                    "run created"
                );
                Ok(DispatchOutcome::Created(run.id))
            }
            InsertOutcome::TickTaken => Ok(DispatchOutcome::AlreadyClaimed),
            InsertOutcome::TriggerBusy => self.skip(&trigger.id, tick, SkipReason::AlreadyRunning),
        }
    }

    /// Create a run outside of any schedule.
    pub fn create_manual_run(&self, request: &ManualRunRequest, now: u64) -> CoordinatorResult<DispatchOutcome> {
        let mut variables = Variables::new();
        let mut exclusive = false;
        if let Some(trigger_id) = &request.trigger_id {
            let Some(trigger) = self.store.get_trigger(trigger_id)? else {
                return Ok(DispatchOutcome::Skipped(SkipReason::TriggerDisabled));
            };
            exclusive = trigger.concurrency == ConcurrencyPolicy::SkipIfRunning;
            variables = trigger.variables;
            variables.insert("trigger_id".to_string(), trigger_id.clone().into());
        }
        variables.extend(request.variables.clone());

        let pipeline = match self.resolve_pipeline(&request.pipeline_id)? {
            Ok(p) => p,
            Err(reason) => return Ok(DispatchOutcome::Skipped(SkipReason::InvalidDefinition(reason))),
        };
        let mut run = new_run(&pipeline, None, variables, now);
        run.trigger_id = request.trigger_id.clone();
        let blocks = match materialize_blocks(&pipeline, &run.id, now) {
            Ok(blocks) => blocks,
            Err(e) => {
                return Ok(DispatchOutcome::Skipped(SkipReason::InvalidDefinition(e.to_string())));
            }
        };

        match self.store.insert_run(&run, &blocks, exclusive)? {
            InsertOutcome::TriggerBusy => Ok(DispatchOutcome::Skipped(SkipReason::AlreadyRunning)),
            _ => {
                info!(run = %run.id, pipeline = %pipeline.id, trigger = ?run.trigger_id, "manual run created");
                Ok(DispatchOutcome::Created(run.id))
            }
        }
    }

    fn resolve_pipeline(&self, pipeline_id: &str) -> Result<Result<PipelineDef, String>, StateError> {
        Ok(self
            .store
            .get_pipeline(pipeline_id)?
            .ok_or_else(|| format!("pipeline '{pipeline_id}' not found")))
    }

    fn skip(&self, trigger_id: &str, tick: u64, reason: SkipReason) -> Result<DispatchOutcome, StateError> {
        let recorded = self.store.record_skipped_tick(trigger_id, tick, &reason.as_record())?;
        if !recorded {
            // Someone else settled the tick first.
            return Ok(DispatchOutcome::AlreadyClaimed);
        }
        match &reason {
            SkipReason::InvalidDefinition(why) => {
                warn!(trigger = %trigger_id, tick, reason = %why, "tick skipped: invalid pipeline definition")
            }
            _ => info!(trigger = %trigger_id, tick, reason = %reason.as_record(), "tick skipped"),
        }
        Ok(DispatchOutcome::Skipped(reason))
    }
}

fn new_run(
    pipeline: &PipelineDef,
    scheduled: Option<(TriggerId, u64)>,
    variables: Variables,
    now: u64,
) -> PipelineRun {
    let (trigger_id, tick) = match scheduled {
        Some((trigger, tick)) => (Some(trigger), Some(tick)),
        None => (None, None),
    };
    PipelineRun {
        id: Uuid::new_v4().to_string(),
        pipeline_id: pipeline.id.clone(),
        trigger_id,
        tick,
        status: PipelineRunStatus::Scheduled,
        failure_policy: pipeline.failure_policy,
        variables,
        cancel_requested: false,
        created_at: now,
        started_at: None,
        finished_at: None,
    }
}

impl IntentSink for RunCoordinator {
    type Error = crate::error::CoordinatorError;

    /// A tick claimed by a live lease but not yet recorded is deferred: if
    /// the holder dies, the tick is offered again once its lease expires.
    fn hand_off(&self, intent: &DispatchIntent, now: u64) -> Result<Handoff, Self::Error> {
        let outcome = self.try_dispatch(intent, now)?;
        if outcome == DispatchOutcome::AlreadyClaimed
            && self.store.get_tick(&intent.trigger_id, intent.tick)?.is_none()
        {
            return Ok(Handoff::Deferred);
        }
        Ok(Handoff::Settled)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use pipegrid_state::{BlockDef, ExecutorKind, FailurePolicy, Schedule, TickRecord};

    use super::*;

    const MINUTE: u64 = 60;

    fn pipeline(id: &str, upstream_of_b: &str) -> PipelineDef {
        PipelineDef {
            id: id.to_string(),
            failure_policy: FailurePolicy::FailFast,
            blocks: vec![
                BlockDef {
                    id: "a".to_string(),
                    upstream: vec![],
                    executor: ExecutorKind::Local,
                    max_retries: 0,
                    command: "true".to_string(),
                },
                BlockDef {
                    id: "b".to_string(),
                    upstream: vec![upstream_of_b.to_string()],
                    executor: ExecutorKind::Local,
                    max_retries: 0,
                    command: "true".to_string(),
                },
            ],
        }
    }

    fn trigger(id: &str, pipeline_id: &str, concurrency: ConcurrencyPolicy) -> Trigger {
        let mut variables = Variables::new();
        variables.insert("env".to_string(), "prod".into());
        Trigger {
            id: id.to_string(),
            pipeline_id: pipeline_id.to_string(),
            schedule: Schedule::Interval { every_secs: MINUTE },
            start_at: 0,
            end_at: None,
            concurrency,
            enabled: true,
            variables,
            last_evaluated_tick: None,
            skipped_ticks: 0,
            created_at: 0,
            updated_at: 0,
        }
    }

    fn setup(concurrency: ConcurrencyPolicy) -> StateStore {
        let store = StateStore::open_in_memory().unwrap();
        store.put_pipeline(&pipeline("etl", "a")).unwrap();
        store.put_trigger(&trigger("hourly", "etl", concurrency)).unwrap();
        store
    }

    fn intent(tick: u64) -> DispatchIntent {
        DispatchIntent {
            trigger_id: "hourly".to_string(),
            tick,
        }
    }

    fn created(outcome: DispatchOutcome) -> RunId {
        match outcome {
            DispatchOutcome::Created(id) => id,
            other => panic!("expected a created run, got {other:?}"),
        }
    }

    #[test]
    fn creates_run_with_pending_blocks_and_variables() {
        let store = setup(ConcurrencyPolicy::AllowOverlap);
        let coordinator = RunCoordinator::new(store.clone(), "replica-a", 30);

        let run_id = created(coordinator.try_dispatch(&intent(120), 125).unwrap());
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.status, PipelineRunStatus::Scheduled);
        assert_eq!(run.tick, Some(120));
        assert_eq!(run.variables["env"], "prod");
        assert_eq!(run.variables["execution_date"], "1970-01-01T00:02:00Z");

        let blocks = store.list_block_runs(&run_id).unwrap();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|b| b.status == pipegrid_state::BlockRunStatus::Pending));
        assert_eq!(
            store.get_tick("hourly", 120).unwrap(),
            Some(TickRecord::Created { run_id })
        );
    }

    #[test]
    fn repeated_intent_is_already_claimed() {
        let store = setup(ConcurrencyPolicy::AllowOverlap);
        let a = RunCoordinator::new(store.clone(), "replica-a", 30);
        let b = RunCoordinator::new(store.clone(), "replica-b", 30);

        created(a.try_dispatch(&intent(60), 61).unwrap());
        assert_eq!(a.try_dispatch(&intent(60), 62).unwrap(), DispatchOutcome::AlreadyClaimed);
        assert_eq!(b.try_dispatch(&intent(60), 62).unwrap(), DispatchOutcome::AlreadyClaimed);
        assert_eq!(store.list_runs().unwrap().len(), 1);
    }

    #[test]
    fn live_lease_of_another_replica_wins() {
        let store = setup(ConcurrencyPolicy::AllowOverlap);
        store.try_acquire_lease(&lease_key("hourly", 60), "replica-a", 60, 30).unwrap();

        let b = RunCoordinator::new(store.clone(), "replica-b", 30);
        assert_eq!(b.try_dispatch(&intent(60), 70).unwrap(), DispatchOutcome::AlreadyClaimed);

        // Replica A died; once its lease expires the tick is up for grabs.
        created(b.try_dispatch(&intent(60), 90).unwrap());
    }

    #[test]
    fn concurrent_replicas_create_exactly_one_run() {
        let store = setup(ConcurrencyPolicy::AllowOverlap);
        let created = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        thread::scope(|scope| {
            for i in 0..8 {
                let coordinator = RunCoordinator::new(store.clone(), format!("replica-{i}"), 30);
                let created = Arc::clone(&created);
                scope.spawn(move || {
                    if let DispatchOutcome::Created(_) = coordinator.try_dispatch(&intent(300), 301).unwrap() {
                        created.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    }
                });
            }
        });

        assert_eq!(created.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(store.list_runs_for_trigger("hourly").unwrap().len(), 1);
    }

    #[test]
    fn skip_if_running_skips_and_records_tick() {
        let store = setup(ConcurrencyPolicy::SkipIfRunning);
        let coordinator = RunCoordinator::new(store.clone(), "replica-a", 30);

        created(coordinator.try_dispatch(&intent(60), 61).unwrap());
        assert_eq!(
            coordinator.try_dispatch(&intent(120), 121).unwrap(),
            DispatchOutcome::Skipped(SkipReason::AlreadyRunning)
        );
        assert!(matches!(
            store.get_tick("hourly", 120).unwrap(),
            Some(TickRecord::Skipped { .. })
        ));
        // Settled: a later replay does not create the run either.
        assert_eq!(coordinator.try_dispatch(&intent(120), 500).unwrap(), DispatchOutcome::AlreadyClaimed);
    }

    #[test]
    fn allow_overlap_creates_concurrent_runs() {
        let store = setup(ConcurrencyPolicy::AllowOverlap);
        let coordinator = RunCoordinator::new(store.clone(), "replica-a", 30);
        created(coordinator.try_dispatch(&intent(60), 61).unwrap());
        created(coordinator.try_dispatch(&intent(120), 121).unwrap());
        assert_eq!(store.list_active_runs().unwrap().len(), 2);
    }

    #[test]
    fn disabled_or_missing_trigger_is_skipped() {
        let store = setup(ConcurrencyPolicy::AllowOverlap);
        store.set_trigger_enabled("hourly", false, 0).unwrap();
        let coordinator = RunCoordinator::new(store.clone(), "replica-a", 30);

        assert_eq!(
            coordinator.try_dispatch(&intent(60), 61).unwrap(),
            DispatchOutcome::Skipped(SkipReason::TriggerDisabled)
        );
        let ghost = DispatchIntent {
            trigger_id: "ghost".to_string(),
            tick: 60,
        };
        assert_eq!(
            coordinator.try_dispatch(&ghost, 61).unwrap(),
            DispatchOutcome::Skipped(SkipReason::TriggerDisabled)
        );
        assert!(store.list_runs().unwrap().is_empty());
    }

    #[test]
    fn invalid_definition_records_skipped_tick() {
        let store = setup(ConcurrencyPolicy::AllowOverlap);
        store.put_pipeline(&pipeline("etl", "missing")).unwrap();
        let coordinator = RunCoordinator::new(store.clone(), "replica-a", 30);

        let outcome = coordinator.try_dispatch(&intent(60), 61).unwrap();
        assert!(matches!(
            outcome,
            DispatchOutcome::Skipped(SkipReason::InvalidDefinition(_))
        ));
        assert!(matches!(
            store.get_tick("hourly", 60).unwrap(),
            Some(TickRecord::Skipped { .. })
        ));
        assert!(store.list_runs().unwrap().is_empty());
    }

    #[test]
    fn manual_run_merges_variables_and_honours_concurrency() {
        let store = setup(ConcurrencyPolicy::SkipIfRunning);
        let coordinator = RunCoordinator::new(store.clone(), "replica-a", 30);

        let mut overrides = Variables::new();
        overrides.insert("env".to_string(), "staging".into());
        let request = ManualRunRequest {
            pipeline_id: "etl".to_string(),
            trigger_id: Some("hourly".to_string()),
            variables: overrides,
        };
        let run_id = created(coordinator.create_manual_run(&request, 10).unwrap());
        let run = store.get_run(&run_id).unwrap().unwrap();
        assert_eq!(run.variables["env"], "staging");
        assert_eq!(run.tick, None);

        assert_eq!(
            coordinator.create_manual_run(&request, 11).unwrap(),
            DispatchOutcome::Skipped(SkipReason::AlreadyRunning)
        );

        let adhoc = ManualRunRequest {
            pipeline_id: "etl".to_string(),
            ..Default::default()
        };
        created(coordinator.create_manual_run(&adhoc, 12).unwrap());
    }

    #[test]
    fn intent_sink_settles_ticks() {
        let store = setup(ConcurrencyPolicy::AllowOverlap);
        let coordinator = RunCoordinator::new(store.clone(), "replica-a", 30);
        assert_eq!(coordinator.hand_off(&intent(60), 61).unwrap(), Handoff::Settled);
        assert_eq!(coordinator.hand_off(&intent(60), 62).unwrap(), Handoff::Settled);
        assert_eq!(store.list_runs().unwrap().len(), 1);
    }

    #[test]
    fn intent_sink_defers_ticks_leased_elsewhere() {
        let store = setup(ConcurrencyPolicy::AllowOverlap);
        store.try_acquire_lease(&lease_key("hourly", 60), "replica-a", 60, 30).unwrap();
        let coordinator = RunCoordinator::new(store.clone(), "replica-b", 30);

        assert_eq!(coordinator.hand_off(&intent(60), 61).unwrap(), Handoff::Deferred);
        assert!(store.list_runs().unwrap().is_empty());

        // replica-a never came back.
        assert_eq!(coordinator.hand_off(&intent(60), 95).unwrap(), Handoff::Settled);
        assert_eq!(store.list_runs().unwrap().len(), 1);
    }
}
