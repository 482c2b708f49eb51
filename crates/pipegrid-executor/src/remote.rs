//! Remote job backends: container jobs and cluster steps.
//!
//! Both submit to a [`JobControlPlane`]. The container backend relies on
//! the control plane rejecting duplicate job names; the cluster backend
//! talks to a control plane without that guarantee and checks for an
//! existing job before creating one.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use pipegrid_state::{ExecutorKind, ExecutorLease};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{ExecutorError, ExecutorResult};
use crate::executor::{BoxFuture, Executor, JobStatus, SubmitRequest};
use crate::local::LocalExecutor;

/// Job handed to a control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobSpec {
    pub name: String,
    pub command: String,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    AlreadyExists,
}

/// Control surface of an external job system.
pub trait JobControlPlane: Send + Sync {
    /// Create a job. Control planes with native de-duplication return
    /// `AlreadyExists` for a known name; others create a second job.
    fn create_job<'a>(&'a self, spec: &'a JobSpec) -> BoxFuture<'a, ExecutorResult<CreateOutcome>>;

    fn job_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecutorResult<bool>>;

    fn job_status<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecutorResult<JobStatus>>;

    fn delete_job<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecutorResult<()>>;
}

/// Deterministic, DNS-safe job name for an idempotency key.
pub fn job_name(prefix: &str, idempotency_key: &str) -> String {
    let digest = hex::encode(Sha256::digest(idempotency_key.as_bytes()));
    format!("{prefix}-{}", &digest[..40])
}

fn job_spec(prefix: &str, request: &SubmitRequest) -> JobSpec {
    JobSpec {
        name: job_name(prefix, &request.idempotency_key()),
        command: request.command.clone(),
        env: request.env(),
    }
}

// ── Container jobs ───────────────────────────────────────────────

pub struct ContainerJobExecutor {
    control: Arc<dyn JobControlPlane>,
}

impl ContainerJobExecutor {
    pub fn new(control: Arc<dyn JobControlPlane>) -> Self {
        Self { control }
    }
}

impl Executor for ContainerJobExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Container
    }

    fn submit<'a>(&'a self, request: &'a SubmitRequest) -> BoxFuture<'a, ExecutorResult<ExecutorLease>> {
        Box::pin(async move {
            let spec = job_spec("pipegrid-job", request);
            let outcome = self.control.create_job(&spec).await?;
            debug!(job = %spec.name, ?outcome, "container job submitted");
            Ok(ExecutorLease {
                executor: ExecutorKind::Container,
                job_id: spec.name,
                attempt: request.attempt,
            })
        })
    }

    fn poll<'a>(&'a self, lease: &'a ExecutorLease) -> BoxFuture<'a, ExecutorResult<JobStatus>> {
        self.control.job_status(&lease.job_id)
    }

    fn cancel<'a>(&'a self, lease: &'a ExecutorLease) -> BoxFuture<'a, ExecutorResult<()>> {
        self.control.delete_job(&lease.job_id)
    }
}

// ── Cluster steps ────────────────────────────────────────────────

pub struct ClusterJobExecutor {
    control: Arc<dyn JobControlPlane>,
}

impl ClusterJobExecutor {
    pub fn new(control: Arc<dyn JobControlPlane>) -> Self {
        Self { control }
    }
}

impl Executor for ClusterJobExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Cluster
    }

    fn submit<'a>(&'a self, request: &'a SubmitRequest) -> BoxFuture<'a, ExecutorResult<ExecutorLease>> {
        Box::pin(async move {
            let spec = job_spec("pipegrid-step", request);
            // No native de-duplication: look before creating.
            if self.control.job_exists(&spec.name).await? {
                debug!(step = %spec.name, "cluster step already submitted");
            } else {
                self.control.create_job(&spec).await?;
                debug!(step = %spec.name, "cluster step submitted");
            }
            Ok(ExecutorLease {
                executor: ExecutorKind::Cluster,
                job_id: spec.name,
                attempt: request.attempt,
            })
        })
    }

    fn poll<'a>(&'a self, lease: &'a ExecutorLease) -> BoxFuture<'a, ExecutorResult<JobStatus>> {
        self.control.job_status(&lease.job_id)
    }

    fn cancel<'a>(&'a self, lease: &'a ExecutorLease) -> BoxFuture<'a, ExecutorResult<()>> {
        self.control.delete_job(&lease.job_id)
    }
}

// ── Process control plane ────────────────────────────────────────

/// Control plane that runs jobs as subprocesses on the local pool.
///
/// Used by the daemon when no external job system is configured, so
/// container and cluster blocks run on the scheduler host under the same
/// concurrency limit as local blocks. Job names are unique per key, so a
/// second create of a known name is reported as `AlreadyExists`.
#[derive(Clone)]
pub struct ProcessControlPlane {
    pool: Arc<LocalExecutor>,
}

impl ProcessControlPlane {
    pub fn new(pool: Arc<LocalExecutor>) -> Self {
        Self { pool }
    }
}

impl JobControlPlane for ProcessControlPlane {
    fn create_job<'a>(&'a self, spec: &'a JobSpec) -> BoxFuture<'a, ExecutorResult<CreateOutcome>> {
        Box::pin(async move {
            if self.pool.spawn_job(&spec.name, &spec.command, spec.env.clone()).await {
                info!(job = %spec.name, "job started on local pool");
                Ok(CreateOutcome::Created)
            } else {
                Ok(CreateOutcome::AlreadyExists)
            }
        })
    }

    fn job_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecutorResult<bool>> {
        Box::pin(async move { Ok(self.pool.has_job(name).await) })
    }

    fn job_status<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecutorResult<JobStatus>> {
        Box::pin(async move { Ok(self.pool.job_status(name).await) })
    }

    fn delete_job<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecutorResult<()>> {
        Box::pin(async move {
            self.pool.cancel_job(name).await;
            Ok(())
        })
    }
}

// ── In-memory control plane ──────────────────────────────────────

#[derive(Debug)]
struct JobRecord {
    spec: JobSpec,
    status: JobStatus,
    /// Times this name was created; above 1 only without native de-duplication.
    creations: u32,
}

#[derive(Debug, Default)]
struct ControlState {
    jobs: HashMap<String, JobRecord>,
    fail_next: u32,
}

/// In-process control plane for tests and simulations.
///
/// Jobs never progress on their own; drive them with [`start`](Self::start),
/// [`complete`](Self::complete) and [`fail`](Self::fail).
#[derive(Clone)]
pub struct InMemoryControlPlane {
    state: Arc<Mutex<ControlState>>,
    native_dedupe: bool,
}

impl InMemoryControlPlane {
    pub fn new(native_dedupe: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(ControlState::default())),
            native_dedupe,
        }
    }

    /// Make the next `n` calls fail with a transient error.
    pub async fn fail_next(&self, n: u32) {
        self.state.lock().await.fail_next = n;
    }

    pub async fn start(&self, name: &str) -> bool {
        self.set_status(name, JobStatus::Running).await
    }

    pub async fn complete(&self, name: &str) -> bool {
        self.set_status(name, JobStatus::Succeeded).await
    }

    pub async fn fail(&self, name: &str, message: &str) -> bool {
        let status = JobStatus::Failed {
            message: message.to_string(),
        };
        self.set_status(name, status).await
    }

    /// How many times `name` was created.
    pub async fn creations(&self, name: &str) -> u32 {
        self.state.lock().await.jobs.get(name).map_or(0, |j| j.creations)
    }

    pub async fn job_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().await.jobs.keys().cloned().collect();
        names.sort();
        names
    }

    pub async fn job_spec(&self, name: &str) -> Option<JobSpec> {
        self.state.lock().await.jobs.get(name).map(|j| j.spec.clone())
    }

    /// Jobs that are neither finished nor cancelled.
    pub async fn live_jobs(&self) -> Vec<String> {
        let state = self.state.lock().await;
        let mut names: Vec<String> = state
            .jobs
            .iter()
            .filter(|(_, j)| !j.status.is_terminal())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    async fn set_status(&self, name: &str, status: JobStatus) -> bool {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(name) {
            Some(job) if !job.status.is_terminal() => {
                job.status = status;
                true
            }
            _ => false,
        }
    }

    fn take_fault(state: &mut ControlState) -> ExecutorResult<()> {
        if state.fail_next > 0 {
            state.fail_next -= 1;
            return Err(ExecutorError::Transient("control plane unavailable".to_string()));
        }
        Ok(())
    }
}

impl JobControlPlane for InMemoryControlPlane {
    fn create_job<'a>(&'a self, spec: &'a JobSpec) -> BoxFuture<'a, ExecutorResult<CreateOutcome>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Self::take_fault(&mut state)?;
            if let Some(job) = state.jobs.get_mut(&spec.name) {
                if self.native_dedupe {
                    return Ok(CreateOutcome::AlreadyExists);
                }
                job.creations += 1;
                job.status = JobStatus::Pending;
                return Ok(CreateOutcome::Created);
            }
            let status = if spec.command.trim().is_empty() {
                JobStatus::Succeeded
            } else {
                JobStatus::Pending
            };
            state.jobs.insert(
                spec.name.clone(),
                JobRecord {
                    spec: spec.clone(),
                    status,
                    creations: 1,
                },
            );
            info!(job = %spec.name, "job created");
            Ok(CreateOutcome::Created)
        })
    }

    fn job_exists<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecutorResult<bool>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Self::take_fault(&mut state)?;
            Ok(state.jobs.contains_key(name))
        })
    }

    fn job_status<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecutorResult<JobStatus>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Self::take_fault(&mut state)?;
            Ok(state
                .jobs
                .get(name)
                .map_or(JobStatus::Unknown, |j| j.status.clone()))
        })
    }

    fn delete_job<'a>(&'a self, name: &'a str) -> BoxFuture<'a, ExecutorResult<()>> {
        Box::pin(async move {
            let mut state = self.state.lock().await;
            Self::take_fault(&mut state)?;
            if let Some(job) = state.jobs.get_mut(name)
                && !job.status.is_terminal()
            {
                job.status = JobStatus::Cancelled;
                info!(job = %name, "job cancelled");
            }
            Ok(())
        })
    }
}
