//! Domain types for the pipegrid state store.
//!
//! These types represent the persisted state of triggers, pipeline
//! definitions, pipeline runs, block runs, tick records and coordination
//! leases. All types are serializable to/from JSON for storage in redb
//! tables.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub use pipegrid_core::{ConcurrencyPolicy, ExecutorKind, FailurePolicy};

/// Unique identifier for a trigger.
pub type TriggerId = String;

/// Unique identifier for a pipeline definition.
pub type PipelineId = String;

/// Unique identifier for a pipeline run.
pub type RunId = String;

/// Block identifier, unique within a pipeline.
pub type BlockId = String;

/// Snapshot of variables handed to every block of a run.
pub type Variables = BTreeMap<String, serde_json::Value>;

// ── Trigger ───────────────────────────────────────────────────────

/// When a trigger fires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    Interval { every_secs: u64 },
    Cron { expression: String },
}

/// Declarative trigger: a pipeline plus a schedule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Trigger {
    pub id: TriggerId,
    pub pipeline_id: PipelineId,
    pub schedule: Schedule,
    /// First eligible tick (epoch seconds).
    pub start_at: u64,
    /// No ticks after this instant.
    pub end_at: Option<u64>,
    pub concurrency: ConcurrencyPolicy,
    pub enabled: bool,
    pub variables: Variables,
    /// Latest tick handed to the run coordinator (the evaluation watermark).
    pub last_evaluated_tick: Option<u64>,
    /// Ticks dropped by catch-up bounding.
    pub skipped_ticks: u64,
    pub created_at: u64,
    pub updated_at: u64,
}

// ── Pipeline definition ──────────────────────────────────────────

/// Static block DAG of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineDef {
    pub id: PipelineId,
    pub failure_policy: FailurePolicy,
    pub blocks: Vec<BlockDef>,
}

/// One block of a pipeline, with its executor already resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockDef {
    pub id: BlockId,
    pub upstream: Vec<BlockId>,
    pub executor: ExecutorKind,
    pub max_retries: u32,
    pub command: String,
}

// ── Pipeline run ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineRunStatus {
    Scheduled,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl PipelineRunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One materialized execution of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline_id: PipelineId,
    /// `None` for manual runs.
    pub trigger_id: Option<TriggerId>,
    /// Scheduled tick this run materializes; `None` for manual runs.
    pub tick: Option<u64>,
    pub status: PipelineRunStatus,
    pub failure_policy: FailurePolicy,
    /// Immutable copy taken at creation time.
    pub variables: Variables,
    pub cancel_requested: bool,
    pub created_at: u64,
    pub started_at: Option<u64>,
    pub finished_at: Option<u64>,
}

// ── Block run ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockRunStatus {
    Pending,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    UpstreamFailed,
    Skipped,
}

impl BlockRunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending | Self::Queued | Self::Running)
    }

    /// Pending or queued: the block has not been handed to an executor.
    pub fn is_not_started(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }
}

/// Classification recorded with a block failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Backend unreachable after exhausting transient retries.
    TransientBackend,
    /// The job itself reported failure.
    Execution,
    /// Malformed pipeline definition.
    Definition,
    /// An upstream block failed.
    Upstream,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BlockError {
    pub class: ErrorClass,
    pub message: String,
}

/// Reference to the backend job that runs one attempt of a block.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ExecutorLease {
    pub executor: ExecutorKind,
    pub job_id: String,
    pub attempt: u32,
}

/// One block's execution state within a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BlockRun {
    pub run_id: RunId,
    pub block_id: BlockId,
    pub upstream: Vec<BlockId>,
    pub status: BlockRunStatus,
    /// 1-based attempt number; retries so far = `attempt - 1`.
    pub attempt: u32,
    pub max_retries: u32,
    /// Backend resolved once at run creation.
    pub executor: ExecutorKind,
    pub command: String,
    pub lease: Option<ExecutorLease>,
    pub last_error: Option<BlockError>,
    /// Earliest submission time for the current attempt (retry backoff).
    pub next_attempt_at: Option<u64>,
    pub updated_at: u64,
}

impl BlockRun {
    /// Materialize a pending block run from its definition.
    pub fn pending(run_id: &str, def: &BlockDef, now: u64) -> Self {
        Self {
            run_id: run_id.to_string(),
            block_id: def.id.clone(),
            upstream: def.upstream.clone(),
            status: BlockRunStatus::Pending,
            attempt: 1,
            max_retries: def.max_retries,
            executor: def.executor,
            command: def.command.clone(),
            lease: None,
            last_error: None,
            next_attempt_at: None,
            updated_at: now,
        }
    }

    /// Lease for the current attempt, if one was accepted.
    pub fn current_lease(&self) -> Option<&ExecutorLease> {
        self.lease.as_ref().filter(|l| l.attempt == self.attempt)
    }
}

// ── Coordination ─────────────────────────────────────────────────

/// Time-bounded ownership of a (trigger, tick) pair by one replica.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CoordinationLease {
    pub key: String,
    pub holder: String,
    pub acquired_at: u64,
    pub expires_at: u64,
}

impl CoordinationLease {
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expires_at
    }
}

/// Durable outcome of a (trigger, tick) pair.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TickRecord {
    Created { run_id: RunId },
    Skipped { reason: String },
}

/// Result of an atomic run insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// Another run already claimed this (trigger, tick).
    TickTaken,
    /// Exclusive insert refused: the trigger has an active run.
    TriggerBusy,
}

/// Aggregate block counts used as the autoscaler's control signal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockCounts {
    pub pending: u64,
    pub queued: u64,
    pub running: u64,
}

/// Build the composite key for a (trigger, tick) pair.
pub fn tick_key(trigger_id: &str, tick: u64) -> String {
    // Zero-padded so keys of one trigger sort by tick.
    format!("{trigger_id}@{tick:020}")
}

impl BlockRun {
    /// Build the composite key for the block runs table.
    pub fn table_key(&self) -> String {
        block_key(&self.run_id, &self.block_id)
    }
}

/// Build the composite key `{run_id}:{block_id}`.
pub fn block_key(run_id: &str, block_id: &str) -> String {
    format!("{run_id}:{block_id}")
}

/// A run and all of its block runs, loaded inside one write transaction.
///
/// Handed to the closure of `StateStore::mutate_run`; whatever the closure
/// changes is written back atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSnapshot {
    pub run: PipelineRun,
    pub blocks: Vec<BlockRun>,
}

impl RunSnapshot {
    pub fn block(&self, block_id: &str) -> Option<&BlockRun> {
        self.blocks.iter().find(|b| b.block_id == block_id)
    }

    pub fn block_mut(&mut self, block_id: &str) -> Option<&mut BlockRun> {
        self.blocks.iter_mut().find(|b| b.block_id == block_id)
    }
}
