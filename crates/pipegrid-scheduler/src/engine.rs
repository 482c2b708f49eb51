//! Block DAG engine: the state machine of one pipeline run.
//!
//! The transition functions operate on a [`RunSnapshot`] and never perform
//! I/O. [`DagEngine`] applies them through `StateStore::mutate_run`, so each
//! transition is one atomic, idempotent update keyed by run, block and
//! attempt: replicas that observe the same job status and report it twice
//! change nothing the second time.

use pipegrid_state::{
    BlockError, BlockId, BlockRun, BlockRunStatus, ErrorClass, ExecutorLease, FailurePolicy,
    PipelineDef, PipelineRunStatus, RunSnapshot, StateStore,
};
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;
use crate::graph::{BlockGraph, GraphError, descendants};
use crate::retry::RetryPolicy;
use crate::status::derive_run_status;

/// What a backend reported for one block attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockOutcome {
    Completed,
    Failed(BlockError),
    /// The job was cancelled outside of a run cancellation.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub run_id: String,
    pub block_id: BlockId,
    pub attempt: u32,
    pub outcome: BlockOutcome,
}

/// Effect of applying a [`StatusReport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// Stale attempt, duplicate, or the block is already terminal.
    Ignored,
    /// Block completed; `queued` lists blocks that became ready.
    Completed { queued: Vec<BlockId> },
    /// Block failed and was re-queued for another attempt.
    Retrying { attempt: u32, not_before: u64 },
    /// Block ended without success; `abandoned` lists blocks that will not run.
    Failed { abandoned: Vec<BlockId> },
}

/// Validate a pipeline and materialize all of its block runs as `pending`,
/// in topological order.
pub fn materialize_blocks(
    pipeline: &PipelineDef,
    run_id: &str,
    now: u64,
) -> Result<Vec<BlockRun>, GraphError> {
    let graph = BlockGraph::from_pipeline(pipeline)?;
    Ok(graph
        .topological_order()
        .iter()
        .filter_map(|id| pipeline.blocks.iter().find(|b| &b.id == id))
        .map(|def| BlockRun::pending(run_id, def, now))
        .collect())
}

fn upstream_completed(snap: &RunSnapshot, block: &BlockRun) -> bool {
    block.upstream.iter().all(|id| {
        snap.block(id)
            .is_some_and(|b| b.status == BlockRunStatus::Completed)
    })
}

/// A fail-fast run halts at its first permanent block failure. A halted run
/// starts nothing new and only waits for its running blocks.
pub fn is_halted(snap: &RunSnapshot) -> bool {
    snap.run.failure_policy == FailurePolicy::FailFast
        && !snap.run.cancel_requested
        && snap
            .blocks
            .iter()
            .any(|b| matches!(b.status, BlockRunStatus::Failed | BlockRunStatus::Cancelled))
}

/// Queue every pending block whose upstreams all completed.
///
/// Nothing becomes ready once the run is terminal, halted or being cancelled.
pub fn queue_ready(snap: &mut RunSnapshot, now: u64) -> Vec<BlockId> {
    if snap.run.status.is_terminal() || snap.run.cancel_requested || is_halted(snap) {
        return Vec::new();
    }
    let ready: Vec<BlockId> = snap
        .blocks
        .iter()
        .filter(|b| b.status == BlockRunStatus::Pending && upstream_completed(snap, b))
        .map(|b| b.block_id.clone())
        .collect();
    for id in &ready {
        if let Some(block) = snap.block_mut(id) {
            block.status = BlockRunStatus::Queued;
            block.updated_at = now;
        }
    }
    ready
}

/// `scheduled -> running`, then queue the initial ready set.
pub fn apply_start(snap: &mut RunSnapshot, now: u64) -> Vec<BlockId> {
    if snap.run.status == PipelineRunStatus::Scheduled {
        snap.run.status = PipelineRunStatus::Running;
        snap.run.started_at = Some(now);
    }
    queue_ready(snap, now)
}

/// `queued -> running` for the given attempt. Refused unless every
/// upstream block completed and the run has not halted.
pub fn apply_mark_running(
    snap: &mut RunSnapshot,
    block_id: &str,
    attempt: u32,
    lease: ExecutorLease,
    now: u64,
) -> bool {
    if snap.run.status != PipelineRunStatus::Running || snap.run.cancel_requested || is_halted(snap) {
        return false;
    }
    let ready = match snap.block(block_id) {
        Some(b) => {
            b.status == BlockRunStatus::Queued && b.attempt == attempt && upstream_completed(snap, b)
        }
        None => false,
    };
    if !ready {
        return false;
    }
    if let Some(block) = snap.block_mut(block_id) {
        block.status = BlockRunStatus::Running;
        block.lease = Some(lease);
        block.next_attempt_at = None;
        block.updated_at = now;
    }
    true
}

/// Abandon not-yet-started blocks after `failed` ended without success.
///
/// Descendants become `upstream_failed`. Under fail-fast every other
/// not-yet-started block becomes `skipped`; running blocks are left to finish.
fn abandon_after(snap: &mut RunSnapshot, failed: &str, now: u64) -> Vec<BlockId> {
    let downstream = descendants(&snap.blocks, failed);
    let fail_fast = snap.run.failure_policy == FailurePolicy::FailFast;
    let mut abandoned = Vec::new();
    for block in &mut snap.blocks {
        if !block.status.is_not_started() {
            continue;
        }
        if downstream.contains(&block.block_id) {
            block.status = BlockRunStatus::UpstreamFailed;
            block.last_error = Some(BlockError {
                class: ErrorClass::Upstream,
                message: format!("upstream block '{failed}' did not complete"),
            });
        } else if fail_fast {
            block.status = BlockRunStatus::Skipped;
        } else {
            continue;
        }
        block.updated_at = now;
        abandoned.push(block.block_id.clone());
    }
    abandoned
}

/// Apply a backend report. Idempotent per (run, block, attempt).
///
/// A failure reported after the run halted is final: no retry is queued.
pub fn apply_report(
    snap: &mut RunSnapshot,
    report: &StatusReport,
    policy: &RetryPolicy,
    now: u64,
) -> ReportOutcome {
    if snap.run.status.is_terminal() {
        return ReportOutcome::Ignored;
    }
    let halted = is_halted(snap);
    let Some(block) = snap.block_mut(&report.block_id) else {
        return ReportOutcome::Ignored;
    };
    let live = matches!(block.status, BlockRunStatus::Queued | BlockRunStatus::Running);
    if !live || block.attempt != report.attempt {
        return ReportOutcome::Ignored;
    }

    block.updated_at = now;
    match &report.outcome {
        BlockOutcome::Completed => {
            block.status = BlockRunStatus::Completed;
            block.last_error = None;
            let queued = queue_ready(snap, now);
            ReportOutcome::Completed { queued }
        }
        BlockOutcome::Failed(error) if !halted && policy.should_retry(block) => {
            block.attempt += 1;
            block.status = BlockRunStatus::Queued;
            block.last_error = Some(error.clone());
            let not_before = policy.next_attempt_at(block.attempt - 1, now);
            block.next_attempt_at = Some(not_before);
            ReportOutcome::Retrying {
                attempt: block.attempt,
                not_before,
            }
        }
        BlockOutcome::Failed(error) => {
            block.status = BlockRunStatus::Failed;
            block.last_error = Some(error.clone());
            let abandoned = abandon_after(snap, &report.block_id, now);
            ReportOutcome::Failed { abandoned }
        }
        BlockOutcome::Cancelled => {
            block.status = BlockRunStatus::Cancelled;
            block.last_error = Some(BlockError {
                class: ErrorClass::Cancelled,
                message: "job cancelled by backend".to_string(),
            });
            let abandoned = abandon_after(snap, &report.block_id, now);
            ReportOutcome::Failed { abandoned }
        }
    }
}

/// Cancel every non-terminal block. Returns the leases of blocks that were
/// running so their jobs can be cancelled at the backend.
pub fn apply_cancel(snap: &mut RunSnapshot, now: u64) -> Vec<ExecutorLease> {
    if snap.run.status.is_terminal() {
        return Vec::new();
    }
    snap.run.cancel_requested = true;
    let mut leases = Vec::new();
    for block in &mut snap.blocks {
        if block.status.is_terminal() {
            continue;
        }
        if block.status == BlockRunStatus::Running
            && let Some(lease) = block.current_lease()
        {
            leases.push(lease.clone());
        }
        block.status = BlockRunStatus::Cancelled;
        block.last_error = Some(BlockError {
            class: ErrorClass::Cancelled,
            message: "run cancelled".to_string(),
        });
        block.updated_at = now;
    }
    leases
}

/// Settle the run status once every block is terminal. Returns the new
/// status if this call changed it.
pub fn finalize(snap: &mut RunSnapshot, now: u64) -> Option<PipelineRunStatus> {
    if snap.run.status.is_terminal() {
        return None;
    }
    let status = derive_run_status(snap.blocks.iter().map(|b| b.status), snap.run.cancel_requested)?;
    snap.run.status = status;
    snap.run.finished_at = Some(now);
    Some(status)
}

/// Persisted front-end to the transition functions.
#[derive(Clone)]
pub struct DagEngine {
    store: StateStore,
    retry: RetryPolicy,
}

impl DagEngine {
    pub fn new(store: StateStore, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Start a scheduled run. Returns the blocks queued by this call.
    pub fn start_run(&self, run_id: &str, now: u64) -> SchedulerResult<Vec<BlockId>> {
        let (queued, finished) = self.store.mutate_run(run_id, |snap| {
            let queued = apply_start(snap, now);
            (queued, finalize(snap, now))
        })?;
        if !queued.is_empty() {
            info!(run = %run_id, queued = ?queued, "run started");
        }
        if let Some(status) = finished {
            info!(run = %run_id, ?status, "run finished");
        }
        Ok(queued)
    }

    /// Record that `attempt` of a block was accepted by a backend.
    pub fn mark_running(
        &self,
        run_id: &str,
        block_id: &str,
        attempt: u32,
        lease: ExecutorLease,
        now: u64,
    ) -> SchedulerResult<bool> {
        let job = lease.job_id.clone();
        let applied = self
            .store
            .mutate_run(run_id, |snap| apply_mark_running(snap, block_id, attempt, lease, now))?;
        if applied {
            debug!(run = %run_id, block = %block_id, attempt, %job, "block running");
        }
        Ok(applied)
    }

    pub fn report(&self, report: &StatusReport, now: u64) -> SchedulerResult<ReportOutcome> {
        let (outcome, finished) = self.store.mutate_run(&report.run_id, |snap| {
            let outcome = apply_report(snap, report, &self.retry, now);
            (outcome, finalize(snap, now))
        })?;

        let (run, block, attempt) = (&report.run_id, &report.block_id, report.attempt);
        match &outcome {
            ReportOutcome::Ignored => {
                debug!(%run, %block, attempt, "stale or duplicate report ignored")
            }
            ReportOutcome::Completed { queued } => {
                info!(%run, %block, attempt, unblocked = ?queued, "block completed")
            }
            ReportOutcome::Retrying { attempt: next, not_before } => {
                warn!(%run, %block, attempt, next_attempt = next, not_before, "block failed, retrying")
            }
            ReportOutcome::Failed { abandoned } => {
                warn!(%run, %block, attempt, abandoned = ?abandoned, "block failed")
            }
        }
        if let Some(status) = finished {
            info!(%run, ?status, "run finished");
        }
        Ok(outcome)
    }

    /// Cancel a run. Returns leases of jobs that were running; cancelling
    /// them at the backend is the caller's job.
    #[must_use = "running jobs keep running unless their leases are cancelled at the backend"]
    pub fn cancel_run(&self, run_id: &str, now: u64) -> SchedulerResult<Vec<ExecutorLease>> {
        let (leases, finished) = self.store.mutate_run(run_id, |snap| {
            let leases = apply_cancel(snap, now);
            (leases, finalize(snap, now))
        })?;
        if let Some(status) = finished {
            info!(run = %run_id, ?status, running_jobs = leases.len(), "run cancelled");
        }
        Ok(leases)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pipegrid_state::{BlockDef, ExecutorKind, InsertOutcome, PipelineRun, Variables};

    use super::*;

    fn pipeline(policy: FailurePolicy, blocks: &[(&str, &[&str])], max_retries: u32) -> PipelineDef {
        PipelineDef {
            id: "p".to_string(),
            failure_policy: policy,
            blocks: blocks
                .iter()
                .map(|(id, upstream)| BlockDef {
                    id: id.to_string(),
                    upstream: upstream.iter().map(|s| s.to_string()).collect(),
                    executor: ExecutorKind::Local,
                    max_retries,
                    command: format!("run {id}"),
                })
                .collect(),
        }
    }

    /// A -> B, A -> C, B -> D.
    fn fork(policy: FailurePolicy) -> PipelineDef {
        pipeline(policy, &[("a", &[]), ("b", &["a"]), ("c", &["a"]), ("d", &["b"])], 0)
    }

    fn setup(def: &PipelineDef) -> (DagEngine, String) {
        let store = StateStore::open_in_memory().unwrap();
        let run = PipelineRun {
            id: "run-1".to_string(),
            pipeline_id: def.id.clone(),
            trigger_id: None,
            tick: None,
            status: PipelineRunStatus::Scheduled,
            failure_policy: def.failure_policy,
            variables: Variables::new(),
            cancel_requested: false,
            created_at: 0,
            started_at: None,
            finished_at: None,
        };
        let blocks = materialize_blocks(def, &run.id, 0).unwrap();
        assert_eq!(store.insert_run(&run, &blocks, false).unwrap(), InsertOutcome::Inserted);
        let retry = RetryPolicy {
            backoff_base: Duration::from_secs(10),
            backoff_max: Duration::from_secs(60),
        };
        (DagEngine::new(store, retry), run.id)
    }

    fn lease(block: &str, attempt: u32) -> ExecutorLease {
        ExecutorLease {
            executor: ExecutorKind::Local,
            job_id: format!("run-1:{block}:{attempt}"),
            attempt,
        }
    }

    fn run_block(engine: &DagEngine, run: &str, block: &str, attempt: u32, outcome: BlockOutcome) -> ReportOutcome {
        assert!(engine.mark_running(run, block, attempt, lease(block, attempt), 1).unwrap());
        engine
            .report(
                &StatusReport {
                    run_id: run.to_string(),
                    block_id: block.to_string(),
                    attempt,
                    outcome,
                },
                1,
            )
            .unwrap()
    }

    fn failed() -> BlockOutcome {
        BlockOutcome::Failed(BlockError {
            class: ErrorClass::Execution,
            message: "exit code 1".to_string(),
        })
    }

    fn status_of(engine: &DagEngine, run: &str, block: &str) -> BlockRunStatus {
        engine.store().get_block_run(run, block).unwrap().unwrap().status
    }

    fn run_status(engine: &DagEngine, run: &str) -> PipelineRunStatus {
        engine.store().get_run(run).unwrap().unwrap().status
    }

    #[test]
    fn materialize_rejects_bad_definitions() {
        let bad = pipeline(FailurePolicy::FailFast, &[("a", &["b"]), ("b", &["a"])], 0);
        assert!(matches!(materialize_blocks(&bad, "r", 0), Err(GraphError::Cycle(_))));
    }

    #[test]
    fn start_queues_roots_only() {
        let (engine, run) = setup(&fork(FailurePolicy::FailFast));
        assert_eq!(engine.start_run(&run, 1).unwrap(), vec!["a".to_string()]);
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Running);
        // Starting twice queues nothing new.
        assert!(engine.start_run(&run, 2).unwrap().is_empty());
    }

    #[test]
    fn happy_path_completes_run() {
        let (engine, run) = setup(&fork(FailurePolicy::FailFast));
        engine.start_run(&run, 1).unwrap();

        let ReportOutcome::Completed { mut queued } =
            run_block(&engine, &run, "a", 1, BlockOutcome::Completed)
        else {
            panic!("expected completion");
        };
        queued.sort();
        assert_eq!(queued, vec!["b".to_string(), "c".to_string()]);
        run_block(&engine, &run, "b", 1, BlockOutcome::Completed);
        run_block(&engine, &run, "c", 1, BlockOutcome::Completed);
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Running);
        run_block(&engine, &run, "d", 1, BlockOutcome::Completed);
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Completed);
    }

    #[test]
    fn mark_running_requires_completed_upstreams() {
        let (engine, run) = setup(&fork(FailurePolicy::FailFast));
        engine.start_run(&run, 1).unwrap();
        // `b` is still pending.
        assert!(!engine.mark_running(&run, "b", 1, lease("b", 1), 1).unwrap());
        // Wrong attempt.
        assert!(!engine.mark_running(&run, "a", 2, lease("a", 2), 1).unwrap());
        assert!(engine.mark_running(&run, "a", 1, lease("a", 1), 1).unwrap());
        // Already running.
        assert!(!engine.mark_running(&run, "a", 1, lease("a", 1), 1).unwrap());
    }

    #[test]
    fn duplicate_and_stale_reports_are_ignored() {
        let (engine, run) = setup(&fork(FailurePolicy::FailFast));
        engine.start_run(&run, 1).unwrap();
        run_block(&engine, &run, "a", 1, BlockOutcome::Completed);

        let again = StatusReport {
            run_id: run.clone(),
            block_id: "a".to_string(),
            attempt: 1,
            outcome: failed(),
        };
        assert_eq!(engine.report(&again, 2).unwrap(), ReportOutcome::Ignored);
        assert_eq!(status_of(&engine, &run, "a"), BlockRunStatus::Completed);
    }

    #[test]
    fn k_retries_give_k_plus_one_attempts() {
        let def = pipeline(FailurePolicy::FailFast, &[("flaky", &[])], 2);
        let (engine, run) = setup(&def);
        engine.start_run(&run, 1).unwrap();

        assert_eq!(
            run_block(&engine, &run, "flaky", 1, failed()),
            ReportOutcome::Retrying { attempt: 2, not_before: 11 }
        );
        let block = engine.store().get_block_run(&run, "flaky").unwrap().unwrap();
        assert_eq!(block.status, BlockRunStatus::Queued);
        assert_eq!(block.next_attempt_at, Some(11));

        assert_eq!(
            run_block(&engine, &run, "flaky", 2, failed()),
            ReportOutcome::Retrying { attempt: 3, not_before: 21 }
        );
        assert!(matches!(run_block(&engine, &run, "flaky", 3, failed()), ReportOutcome::Failed { .. }));

        let block = engine.store().get_block_run(&run, "flaky").unwrap().unwrap();
        assert_eq!(block.attempt, 3);
        assert_eq!(block.status, BlockRunStatus::Failed);
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Failed);
    }

    #[test]
    fn fail_fast_abandons_everything_not_started() {
        let (engine, run) = setup(&fork(FailurePolicy::FailFast));
        engine.start_run(&run, 1).unwrap();
        run_block(&engine, &run, "a", 1, BlockOutcome::Completed);

        // `c` is running when `b` fails.
        assert!(engine.mark_running(&run, "c", 1, lease("c", 1), 1).unwrap());
        let outcome = engine
            .report(
                &StatusReport {
                    run_id: run.clone(),
                    block_id: "b".to_string(),
                    attempt: 1,
                    outcome: failed(),
                },
                2,
            )
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Failed { abandoned: vec!["d".to_string()] });
        assert_eq!(status_of(&engine, &run, "d"), BlockRunStatus::UpstreamFailed);
        assert_eq!(status_of(&engine, &run, "c"), BlockRunStatus::Running);
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Running);

        engine
            .report(
                &StatusReport {
                    run_id: run.clone(),
                    block_id: "c".to_string(),
                    attempt: 1,
                    outcome: BlockOutcome::Completed,
                },
                3,
            )
            .unwrap();
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Failed);
    }

    #[test]
    fn halted_fail_fast_run_does_not_retry_running_blocks() {
        let mut def = pipeline(FailurePolicy::FailFast, &[("a", &[]), ("c", &[])], 0);
        def.blocks[1].max_retries = 3;
        let (engine, run) = setup(&def);
        engine.start_run(&run, 1).unwrap();
        assert!(engine.mark_running(&run, "a", 1, lease("a", 1), 1).unwrap());
        assert!(engine.mark_running(&run, "c", 1, lease("c", 1), 1).unwrap());

        let report = |block: &str| StatusReport {
            run_id: run.clone(),
            block_id: block.to_string(),
            attempt: 1,
            outcome: failed(),
        };
        assert_eq!(engine.report(&report("a"), 2).unwrap(), ReportOutcome::Failed { abandoned: vec![] });
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Running);

        // `c` still has retries left, but the run already halted.
        assert_eq!(engine.report(&report("c"), 3).unwrap(), ReportOutcome::Failed { abandoned: vec![] });
        let block = engine.store().get_block_run(&run, "c").unwrap().unwrap();
        assert_eq!(block.status, BlockRunStatus::Failed);
        assert_eq!(block.attempt, 1);
        assert!(!engine.mark_running(&run, "c", 2, lease("c", 2), 4).unwrap());
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Failed);
    }

    #[test]
    fn halted_run_refuses_to_start_queued_retries() {
        let mut def = pipeline(FailurePolicy::FailFast, &[("a", &[]), ("c", &[])], 0);
        def.blocks[1].max_retries = 3;
        let (engine, run) = setup(&def);
        engine.start_run(&run, 1).unwrap();
        assert!(engine.mark_running(&run, "a", 1, lease("a", 1), 1).unwrap());

        // `c` fails first and is queued for a second attempt.
        assert!(matches!(run_block(&engine, &run, "c", 1, failed()), ReportOutcome::Retrying { attempt: 2, .. }));
        let outcome = engine
            .report(
                &StatusReport {
                    run_id: run.clone(),
                    block_id: "a".to_string(),
                    attempt: 1,
                    outcome: failed(),
                },
                2,
            )
            .unwrap();
        assert_eq!(outcome, ReportOutcome::Failed { abandoned: vec!["c".to_string()] });
        assert_eq!(status_of(&engine, &run, "c"), BlockRunStatus::Skipped);
        assert!(!engine.mark_running(&run, "c", 2, lease("c", 2), 20).unwrap());
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Failed);
    }

    #[test]
    fn best_effort_keeps_retrying_after_another_failure() {
        let mut def = pipeline(FailurePolicy::BestEffort, &[("a", &[]), ("c", &[])], 0);
        def.blocks[1].max_retries = 1;
        let (engine, run) = setup(&def);
        engine.start_run(&run, 1).unwrap();
        assert!(engine.mark_running(&run, "c", 1, lease("c", 1), 1).unwrap());

        run_block(&engine, &run, "a", 1, failed());
        let outcome = engine
            .report(
                &StatusReport {
                    run_id: run.clone(),
                    block_id: "c".to_string(),
                    attempt: 1,
                    outcome: failed(),
                },
                2,
            )
            .unwrap();
        assert!(matches!(outcome, ReportOutcome::Retrying { attempt: 2, .. }));
        assert!(engine.mark_running(&run, "c", 2, lease("c", 2), 20).unwrap());
    }

    #[test]
    fn fail_fast_skips_independent_queued_blocks() {
        let (engine, run) = setup(&fork(FailurePolicy::FailFast));
        engine.start_run(&run, 1).unwrap();
        run_block(&engine, &run, "a", 1, BlockOutcome::Completed);

        run_block(&engine, &run, "b", 1, failed());
        assert_eq!(status_of(&engine, &run, "c"), BlockRunStatus::Skipped);
        assert_eq!(status_of(&engine, &run, "d"), BlockRunStatus::UpstreamFailed);
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Failed);
    }

    #[test]
    fn best_effort_lets_independent_branches_finish() {
        let (engine, run) = setup(&fork(FailurePolicy::BestEffort));
        engine.start_run(&run, 1).unwrap();
        run_block(&engine, &run, "a", 1, BlockOutcome::Completed);

        run_block(&engine, &run, "b", 1, failed());
        assert_eq!(status_of(&engine, &run, "d"), BlockRunStatus::UpstreamFailed);
        assert_eq!(status_of(&engine, &run, "c"), BlockRunStatus::Queued);

        run_block(&engine, &run, "c", 1, BlockOutcome::Completed);
        assert_eq!(status_of(&engine, &run, "c"), BlockRunStatus::Completed);
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Failed);
    }

    #[test]
    fn cancel_returns_running_leases_and_ignores_late_reports() {
        let (engine, run) = setup(&fork(FailurePolicy::FailFast));
        engine.start_run(&run, 1).unwrap();
        assert!(engine.mark_running(&run, "a", 1, lease("a", 1), 1).unwrap());

        let leases = engine.cancel_run(&run, 5).unwrap();
        assert_eq!(leases, vec![lease("a", 1)]);
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Cancelled);
        for block in ["a", "b", "c", "d"] {
            assert_eq!(status_of(&engine, &run, block), BlockRunStatus::Cancelled);
        }

        let late = StatusReport {
            run_id: run.clone(),
            block_id: "a".to_string(),
            attempt: 1,
            outcome: BlockOutcome::Completed,
        };
        assert_eq!(engine.report(&late, 6).unwrap(), ReportOutcome::Ignored);
        assert!(engine.cancel_run(&run, 7).unwrap().is_empty());
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Cancelled);
    }

    #[test]
    fn backend_cancellation_fails_the_block() {
        let (engine, run) = setup(&fork(FailurePolicy::BestEffort));
        engine.start_run(&run, 1).unwrap();
        let outcome = run_block(&engine, &run, "a", 1, BlockOutcome::Cancelled);
        assert!(matches!(outcome, ReportOutcome::Failed { .. }));
        assert_eq!(run_status(&engine, &run), PipelineRunStatus::Failed);
    }
}
