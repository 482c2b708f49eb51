//! Per-replica run driver.
//!
//! Every tick walks the active runs: starts scheduled ones, submits queued
//! blocks whose backoff gate has passed, polls running blocks and feeds the
//! observed job status back into the engine. It never waits for a job to
//! finish. Several replicas may drive the same run at once; the engine's
//! keyed transitions and idempotent submission keep that harmless.

use std::sync::Arc;

use pipegrid_executor::{BackoffTracker, BackoffVerdict, Dispatcher, ExecutorError, JobStatus};
use pipegrid_state::{
    BlockError, BlockRun, BlockRunStatus, ErrorClass, ExecutorLease, PipelineRunStatus, Variables,
};
use tracing::{debug, warn};

use crate::engine::{BlockOutcome, DagEngine, ReportOutcome, StatusReport};
use crate::error::SchedulerResult;

/// Counters for one driver tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverReport {
    pub runs_started: usize,
    pub submitted: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

impl DriverReport {
    fn record(&mut self, outcome: &ReportOutcome) {
        match outcome {
            ReportOutcome::Ignored => {}
            ReportOutcome::Completed { .. } => self.completed += 1,
            ReportOutcome::Retrying { .. } => self.retried += 1,
            ReportOutcome::Failed { .. } => self.failed += 1,
        }
    }
}

fn attempt_key(block: &BlockRun) -> String {
    format!("{}:{}:{}", block.run_id, block.block_id, block.attempt)
}

pub struct RunDriver {
    engine: DagEngine,
    dispatcher: Arc<Dispatcher>,
    backoff: BackoffTracker,
}

impl RunDriver {
    pub fn new(engine: DagEngine, dispatcher: Arc<Dispatcher>, backoff: BackoffTracker) -> Self {
        Self {
            engine,
            dispatcher,
            backoff,
        }
    }

    pub fn engine(&self) -> &DagEngine {
        &self.engine
    }

    /// Advance every active run by one step.
    pub async fn tick(&mut self, now: u64) -> SchedulerResult<DriverReport> {
        let mut report = DriverReport::default();
        for run in self.engine.store().list_active_runs()? {
            if run.status == PipelineRunStatus::Scheduled {
                self.engine.start_run(&run.id, now)?;
                report.runs_started += 1;
            }
            let Some(snap) = self.engine.store().load_run(&run.id)? else {
                continue;
            };
            if snap.run.status.is_terminal() {
                continue;
            }
            for block in &snap.blocks {
                match block.status {
                    BlockRunStatus::Queued if block.next_attempt_at.is_none_or(|t| now >= t) => {
                        self.submit_block(block, &snap.run.variables, now, &mut report)
                            .await?;
                    }
                    BlockRunStatus::Running => self.poll_block(block, now, &mut report).await?,
                    _ => {}
                }
            }
        }
        if report != DriverReport::default() {
            debug!(?report, "driver tick");
        }
        Ok(report)
    }

    /// Cancel a run and ask the backends to stop its running jobs.
    pub async fn cancel_run(&self, run_id: &str, now: u64) -> SchedulerResult<usize> {
        let leases = self.engine.cancel_run(run_id, now)?;
        for lease in &leases {
            self.cancel_job(lease).await;
        }
        Ok(leases.len())
    }

    async fn cancel_job(&self, lease: &ExecutorLease) {
        if let Err(e) = self.dispatcher.cancel(lease).await {
            warn!(job = %lease.job_id, executor = %lease.executor, error = %e, "job cancellation failed");
        }
    }

    async fn submit_block(
        &mut self,
        block: &BlockRun,
        variables: &Variables,
        now: u64,
        report: &mut DriverReport,
    ) -> SchedulerResult<()> {
        let key = attempt_key(block);
        if !self.backoff.ready(&key, now) {
            return Ok(());
        }

        match self.dispatcher.submit(block, variables).await {
            Ok(lease) => {
                self.backoff.record_success(&key);
                let marked = self.engine.mark_running(
                    &block.run_id,
                    &block.block_id,
                    block.attempt,
                    lease.clone(),
                    now,
                )?;
                if marked {
                    report.submitted += 1;
                } else if self.is_settled(block)? {
                    // The block was cancelled or abandoned while the job was
                    // being submitted.
                    self.cancel_job(&lease).await;
                }
            }
            Err(e) if e.is_transient() => self.transient_failure(block, &key, &e, now, report)?,
            Err(e) => {
                let class = match e {
                    ExecutorError::NoBackend(_) => ErrorClass::Definition,
                    _ => ErrorClass::Execution,
                };
                self.fail_block(block, class, e.to_string(), now, report)?;
            }
        }
        Ok(())
    }

    async fn poll_block(&mut self, block: &BlockRun, now: u64, report: &mut DriverReport) -> SchedulerResult<()> {
        let Some(lease) = block.current_lease() else {
            warn!(run = %block.run_id, block = %block.block_id, "running block has no lease");
            return Ok(());
        };
        let key = attempt_key(block);
        if !self.backoff.ready(&key, now) {
            return Ok(());
        }

        match self.dispatcher.poll(lease).await {
            Ok(status) => {
                self.backoff.record_success(&key);
                let outcome = match status {
                    JobStatus::Pending | JobStatus::Running => return Ok(()),
                    JobStatus::Succeeded => BlockOutcome::Completed,
                    JobStatus::Cancelled => BlockOutcome::Cancelled,
                    JobStatus::Failed { message } => BlockOutcome::Failed(BlockError {
                        class: ErrorClass::Execution,
                        message,
                    }),
                    JobStatus::Unknown => BlockOutcome::Failed(BlockError {
                        class: ErrorClass::Execution,
                        message: format!("job '{}' not found at backend", lease.job_id),
                    }),
                };
                self.apply(block, outcome, now, report)?;
            }
            Err(e) if e.is_transient() => self.transient_failure(block, &key, &e, now, report)?,
            Err(e) => self.fail_block(block, ErrorClass::Execution, e.to_string(), now, report)?,
        }
        Ok(())
    }

    fn transient_failure(
        &mut self,
        block: &BlockRun,
        key: &str,
        error: &ExecutorError,
        now: u64,
        report: &mut DriverReport,
    ) -> SchedulerResult<()> {
        match self.backoff.record_failure(key, now) {
            BackoffVerdict::RetryAt(at) => {
                debug!(%key, error = %error, retry_at = at, "transient backend error");
                Ok(())
            }
            BackoffVerdict::Exhausted { failures } => {
                let message = format!("backend unavailable after {failures} attempts: {error}");
                self.fail_block(block, ErrorClass::TransientBackend, message, now, report)
            }
        }
    }

    fn fail_block(
        &self,
        block: &BlockRun,
        class: ErrorClass,
        message: String,
        now: u64,
        report: &mut DriverReport,
    ) -> SchedulerResult<()> {
        self.apply(block, BlockOutcome::Failed(BlockError { class, message }), now, report)
    }

    fn apply(
        &self,
        block: &BlockRun,
        outcome: BlockOutcome,
        now: u64,
        report: &mut DriverReport,
    ) -> SchedulerResult<()> {
        let status = StatusReport {
            run_id: block.run_id.clone(),
            block_id: block.block_id.clone(),
            attempt: block.attempt,
            outcome,
        };
        let outcome = self.engine.report(&status, now)?;
        report.record(&outcome);
        Ok(())
    }

    fn is_settled(&self, block: &BlockRun) -> SchedulerResult<bool> {
        Ok(self
            .engine
            .store()
            .get_block_run(&block.run_id, &block.block_id)?
            .is_some_and(|b| b.status.is_terminal()))
    }
}
