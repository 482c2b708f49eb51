//! Executor capability trait.
//!
//! A backend submits block attempts and later polls or cancels the job it
//! started. Submission must be idempotent per [`SubmitRequest::idempotency_key`]:
//! submitting the same attempt twice yields the same lease and at most one
//! running job.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use pipegrid_state::{BlockRun, ExecutorKind, ExecutorLease, Variables};

use crate::error::ExecutorResult;

/// Boxed future returned by executor operations.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// One block attempt handed to a backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SubmitRequest {
    pub run_id: String,
    pub block_id: String,
    pub attempt: u32,
    pub command: String,
    pub variables: Variables,
}

impl SubmitRequest {
    pub fn for_block(block: &BlockRun, variables: &Variables) -> Self {
        Self {
            run_id: block.run_id.clone(),
            block_id: block.block_id.clone(),
            attempt: block.attempt,
            command: block.command.clone(),
            variables: variables.clone(),
        }
    }

    /// Stable identity of this attempt: `{run_id}:{block_id}:{attempt}`.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.run_id, self.block_id, self.attempt)
    }

    /// Environment exported to the job.
    pub fn env(&self) -> BTreeMap<String, String> {
        let variables = serde_json::to_string(&self.variables).unwrap_or_else(|_| "{}".to_string());
        BTreeMap::from([
            ("PIPEGRID_RUN_ID".to_string(), self.run_id.clone()),
            ("PIPEGRID_BLOCK_ID".to_string(), self.block_id.clone()),
            ("PIPEGRID_ATTEMPT".to_string(), self.attempt.to_string()),
            ("PIPEGRID_VARIABLES".to_string(), variables),
        ])
    }
}

/// Backend view of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed { message: String },
    Cancelled,
    /// The backend has no record of the job.
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Running)
    }
}

pub trait Executor: Send + Sync {
    fn kind(&self) -> ExecutorKind;

    fn submit<'a>(&'a self, request: &'a SubmitRequest) -> BoxFuture<'a, ExecutorResult<ExecutorLease>>;

    fn poll<'a>(&'a self, lease: &'a ExecutorLease) -> BoxFuture<'a, ExecutorResult<JobStatus>>;

    /// Best-effort: cancelling a finished or unknown job is not an error.
    fn cancel<'a>(&'a self, lease: &'a ExecutorLease) -> BoxFuture<'a, ExecutorResult<()>>;
}

#[cfg(test)]
mod tests {
    use pipegrid_state::{BlockDef, BlockRunStatus};

    use super::*;

    #[test]
    fn key_and_env_follow_block_attempt() {
        let def = BlockDef {
            id: "load".to_string(),
            upstream: vec![],
            executor: ExecutorKind::Local,
            max_retries: 2,
            command: "true".to_string(),
        };
        let mut block = BlockRun::pending("run-1", &def, 0);
        block.status = BlockRunStatus::Queued;
        block.attempt = 2;
        let variables = Variables::from([("env".to_string(), serde_json::json!("prod"))]);

        let request = SubmitRequest::for_block(&block, &variables);
        assert_eq!(request.idempotency_key(), "run-1:load:2");

        let env = request.env();
        assert_eq!(env["PIPEGRID_ATTEMPT"], "2");
        assert_eq!(env["PIPEGRID_VARIABLES"], r#"{"env":"prod"}"#);
    }
}
