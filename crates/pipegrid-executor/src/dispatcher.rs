//! Routes block attempts to the executor backend chosen at run creation.

use std::collections::HashMap;
use std::sync::Arc;

use pipegrid_state::{BlockRun, ExecutorKind, ExecutorLease, Variables};
use tracing::debug;

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{Executor, JobStatus, SubmitRequest};

#[derive(Clone, Default)]
pub struct Dispatcher {
    executors: HashMap<ExecutorKind, Arc<dyn Executor>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under its own kind, replacing any previous one.
    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors.insert(executor.kind(), executor);
    }

    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.register(executor);
        self
    }

    pub fn kinds(&self) -> Vec<ExecutorKind> {
        let mut kinds: Vec<_> = self.executors.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    fn executor(&self, kind: ExecutorKind) -> ExecutorResult<&Arc<dyn Executor>> {
        self.executors.get(&kind).ok_or(ExecutorError::NoBackend(kind))
    }

    /// Submit the current attempt of `block`.
    ///
    /// A lease already recorded for this attempt is returned as-is, so a
    /// replica that crashed after submitting never submits twice.
    pub async fn submit(&self, block: &BlockRun, variables: &Variables) -> ExecutorResult<ExecutorLease> {
        if let Some(lease) = block.current_lease() {
            debug!(run = %block.run_id, block = %block.block_id, job = %lease.job_id, "reusing recorded lease");
            return Ok(lease.clone());
        }
        let request = SubmitRequest::for_block(block, variables);
        self.executor(block.executor)?.submit(&request).await
    }

    pub async fn poll(&self, lease: &ExecutorLease) -> ExecutorResult<JobStatus> {
        self.executor(lease.executor)?.poll(lease).await
    }

    pub async fn cancel(&self, lease: &ExecutorLease) -> ExecutorResult<()> {
        self.executor(lease.executor)?.cancel(lease).await
    }
}
