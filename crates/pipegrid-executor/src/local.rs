//! In-process executor: runs block commands as `sh -c` subprocesses.
//!
//! The job table is keyed by idempotency key, so a repeated submit of the
//! same attempt returns the existing job. Finished jobs are kept for a
//! retention window and then dropped on a later submit. The table lives in
//! memory; after a restart or eviction earlier jobs poll as
//! [`JobStatus::Unknown`].

use std::collections::{BTreeMap, HashMap};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use pipegrid_state::{ExecutorKind, ExecutorLease};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{RwLock, Semaphore, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::ExecutorResult;
use crate::executor::{BoxFuture, Executor, JobStatus, SubmitRequest};

/// How long a finished job stays pollable.
pub const DEFAULT_JOB_RETENTION: Duration = Duration::from_secs(600);

struct LocalJob {
    status: watch::Receiver<JobStatus>,
    cancel: Option<oneshot::Sender<()>>,
    /// First time a sweep saw the job finished.
    finished_at: Option<Instant>,
}

pub struct LocalExecutor {
    jobs: Arc<RwLock<HashMap<String, LocalJob>>>,
    slots: Arc<Semaphore>,
    capacity: AtomicUsize,
    retention: Duration,
}

impl LocalExecutor {
    /// `max_concurrency` bounds the number of live subprocesses; extra jobs
    /// stay `Pending` until a slot frees up.
    pub fn new(max_concurrency: usize) -> Self {
        let capacity = max_concurrency.max(1);
        Self {
            jobs: Arc::new(RwLock::new(HashMap::new())),
            slots: Arc::new(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            retention: DEFAULT_JOB_RETENTION,
        }
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Resize the subprocess pool. Growing is immediate; shrinking retires
    /// slots as running jobs release them. Must be called within a tokio
    /// runtime.
    pub fn set_capacity(&self, capacity: usize) {
        let capacity = capacity.max(1);
        let previous = self.capacity.swap(capacity, Ordering::SeqCst);
        if capacity > previous {
            self.slots.add_permits(capacity - previous);
        } else if capacity < previous {
            let excess = (previous - capacity) as u32;
            let slots = Arc::clone(&self.slots);
            tokio::spawn(async move {
                if let Ok(permits) = slots.acquire_many_owned(excess).await {
                    permits.forget();
                }
            });
        }
        info!(from = previous, to = capacity, "local executor resized");
    }

    /// Number of jobs in the table (for tests and diagnostics).
    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Start `command` under `key` unless a job with that key is known.
    /// Returns whether a new process was started.
    pub(crate) async fn spawn_job(&self, key: &str, command: &str, env: BTreeMap<String, String>) -> bool {
        let mut jobs = self.jobs.write().await;
        let evicted = sweep_finished(&mut jobs, self.retention, Instant::now());
        if evicted > 0 {
            debug!(evicted, "finished local jobs evicted");
        }
        if jobs.contains_key(key) {
            debug!(job = %key, "local job already submitted");
            return false;
        }

        let (status_tx, status_rx) = watch::channel(JobStatus::Pending);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        jobs.insert(
            key.to_string(),
            LocalJob {
                status: status_rx,
                cancel: Some(cancel_tx),
                finished_at: None,
            },
        );
        drop(jobs);

        let slots = Arc::clone(&self.slots);
        let key = key.to_string();
        let command = command.to_string();
        tokio::spawn(async move {
            let Ok(_permit) = slots.acquire_owned().await else {
                let _ = status_tx.send(JobStatus::Failed {
                    message: "executor shut down".to_string(),
                });
                return;
            };
            let status = run_command(&key, &command, env, &status_tx, cancel_rx).await;
            let _ = status_tx.send(status);
        });
        true
    }

    pub(crate) async fn has_job(&self, key: &str) -> bool {
        self.jobs.read().await.contains_key(key)
    }

    pub(crate) async fn job_status(&self, key: &str) -> JobStatus {
        let jobs = self.jobs.read().await;
        match jobs.get(key) {
            Some(job) => job.status.borrow().clone(),
            None => JobStatus::Unknown,
        }
    }

    pub(crate) async fn cancel_job(&self, key: &str) {
        let mut jobs = self.jobs.write().await;
        if let Some(cancel) = jobs.get_mut(key).and_then(|job| job.cancel.take()) {
            let _ = cancel.send(());
            debug!(job = %key, "local job cancellation requested");
        }
    }

    async fn submit_job(&self, request: &SubmitRequest) -> ExecutorResult<ExecutorLease> {
        let key = request.idempotency_key();
        if self.spawn_job(&key, &request.command, request.env()).await {
            info!(job = %key, "local job submitted");
        }
        Ok(ExecutorLease {
            executor: ExecutorKind::Local,
            job_id: key,
            attempt: request.attempt,
        })
    }
}

/// Drop jobs that finished more than `retention` ago. A job's clock starts
/// at the first sweep that sees it finished. Live jobs are never dropped.
fn sweep_finished(jobs: &mut HashMap<String, LocalJob>, retention: Duration, now: Instant) -> usize {
    let before = jobs.len();
    jobs.retain(|_, job| {
        if !job.status.borrow().is_terminal() {
            return true;
        }
        let finished_at = *job.finished_at.get_or_insert(now);
        now.duration_since(finished_at) < retention
    });
    before - jobs.len()
}

/// Run one block command to completion or cancellation.
async fn run_command(
    key: &str,
    command: &str,
    env: BTreeMap<String, String>,
    status_tx: &watch::Sender<JobStatus>,
    mut cancel_rx: oneshot::Receiver<()>,
) -> JobStatus {
    // Cancelled while waiting for a slot.
    if cancel_rx.try_recv().is_ok() {
        return JobStatus::Cancelled;
    }
    if command.trim().is_empty() {
        debug!(job = %key, "empty command, nothing to run");
        return JobStatus::Succeeded;
    }

    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .envs(env)
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(job = %key, error = %e, "failed to spawn block process");
            return JobStatus::Failed {
                message: format!("spawn failed: {e}"),
            };
        }
    };
    let _ = status_tx.send(JobStatus::Running);

    // Drain stderr so the pipe never fills; keep the last line for the error.
    let stderr_tail = child.stderr.take().map(|stderr| {
        let key = key.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            let mut last = None;
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(job = %key, "stderr: {}", line);
                last = Some(line);
            }
            last
        })
    });

    tokio::select! {
        exit = child.wait() => {
            let last_line = match stderr_tail {
                Some(handle) => handle.await.ok().flatten(),
                None => None,
            };
            match exit {
                Ok(status) if status.success() => {
                    info!(job = %key, "block process succeeded");
                    JobStatus::Succeeded
                }
                Ok(status) => {
                    let code = status.code().unwrap_or(-1);
                    info!(job = %key, exit_code = code, "block process failed");
                    let mut message = format!("exit code {code}");
                    if let Some(line) = last_line {
                        message.push_str(": ");
                        message.push_str(&line);
                    }
                    JobStatus::Failed { message }
                }
                Err(e) => JobStatus::Failed {
                    message: format!("wait failed: {e}"),
                },
            }
        }
        Ok(()) = &mut cancel_rx => {
            info!(job = %key, "killing block process on cancellation");
            if let Err(e) = child.kill().await {
                warn!(job = %key, error = %e, "failed to kill block process");
            }
            JobStatus::Cancelled
        }
    }
}

impl Executor for LocalExecutor {
    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Local
    }

    fn submit<'a>(&'a self, request: &'a SubmitRequest) -> BoxFuture<'a, ExecutorResult<ExecutorLease>> {
        Box::pin(self.submit_job(request))
    }

    fn poll<'a>(&'a self, lease: &'a ExecutorLease) -> BoxFuture<'a, ExecutorResult<JobStatus>> {
        Box::pin(async move { Ok(self.job_status(&lease.job_id).await) })
    }

    fn cancel<'a>(&'a self, lease: &'a ExecutorLease) -> BoxFuture<'a, ExecutorResult<()>> {
        Box::pin(async move {
            self.cancel_job(&lease.job_id).await;
            Ok(())
        })
    }
}
