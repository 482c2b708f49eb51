//! StateStore — redb-backed state persistence for pipegrid.
//!
//! Provides typed operations over triggers, pipeline definitions, runs,
//! block runs, tick records and coordination leases. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! redb serializes write transactions, so every compare-and-set below
//! (lease acquisition, tick claims, run mutations) is atomic with respect
//! to every other replica sharing the same database.

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTableMut<'txn> = Table<'txn, &'static str, &'static [u8]>;

fn read_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Storage))? {
        Some(guard) => serde_json::from_slice(guard.value())
            .map(Some)
            .map_err(map_err!(Decode)),
        None => Ok(None),
    }
}

fn write_json<T: Serialize>(table: &mut JsonTableMut<'_>, key: &str, value: &T) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Encode))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Storage))?;
    Ok(())
}

fn scan_all<T, R>(table: &R) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Storage))? {
        let (_, value) = entry.map_err(map_err!(Storage))?;
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Decode))?);
    }
    Ok(results)
}

/// Values whose key starts with `prefix`, in key order.
fn scan_prefix<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.range(prefix..).map_err(map_err!(Storage))? {
        let (key, value) = entry.map_err(map_err!(Storage))?;
        if !key.value().starts_with(prefix) {
            break;
        }
        results.push(serde_json::from_slice(value.value()).map_err(map_err!(Decode))?);
    }
    Ok(results)
}

fn active_run_ids<R>(table: &R) -> StateResult<Vec<(RunId, Option<TriggerId>)>>
where
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut ids = Vec::new();
    for entry in table.iter().map_err(map_err!(Storage))? {
        let (key, value) = entry.map_err(map_err!(Storage))?;
        let trigger: Option<TriggerId> =
            serde_json::from_slice(value.value()).map_err(map_err!(Decode))?;
        ids.push((key.value().to_string(), trigger));
    }
    Ok(ids)
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for def in [TRIGGERS, PIPELINES, RUNS, BLOCK_RUNS, ACTIVE_RUNS, TICKS, LEASES] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_json(&table, key)
    }

    fn put_json<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            write_json(&mut table, key, value)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn list_json<T: DeserializeOwned>(&self, def: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan_all(&table)
    }

    fn delete_key(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Storage))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Triggers ───────────────────────────────────────────────────

    /// Insert or overwrite a trigger verbatim.
    pub fn put_trigger(&self, trigger: &Trigger) -> StateResult<()> {
        self.put_json(TRIGGERS, &trigger.id, trigger)?;
        debug!(trigger = %trigger.id, "trigger stored");
        Ok(())
    }

    /// Upsert a trigger's declarative fields, keeping the stored watermark,
    /// skipped-tick count and creation time of an existing trigger.
    pub fn sync_trigger(&self, trigger: &Trigger) -> StateResult<Trigger> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let merged;
        {
            let mut table = txn.open_table(TRIGGERS).map_err(map_err!(Table))?;
            let mut next = trigger.clone();
            if let Some(existing) = read_json::<Trigger, _>(&table, &trigger.id)? {
                next.last_evaluated_tick = existing.last_evaluated_tick;
                next.skipped_ticks = existing.skipped_ticks;
                next.created_at = existing.created_at;
            }
            write_json(&mut table, &next.id, &next)?;
            merged = next;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(trigger = %merged.id, watermark = ?merged.last_evaluated_tick, "trigger synced");
        Ok(merged)
    }

    pub fn get_trigger(&self, trigger_id: &str) -> StateResult<Option<Trigger>> {
        self.get_json(TRIGGERS, trigger_id)
    }

    pub fn list_triggers(&self) -> StateResult<Vec<Trigger>> {
        self.list_json(TRIGGERS)
    }

    /// Delete a trigger. Returns true if it existed.
    pub fn delete_trigger(&self, trigger_id: &str) -> StateResult<bool> {
        let existed = self.delete_key(TRIGGERS, trigger_id)?;
        debug!(trigger = %trigger_id, existed, "trigger deleted");
        Ok(existed)
    }

    /// Enable or disable a trigger. Returns false if the trigger is unknown.
    pub fn set_trigger_enabled(&self, trigger_id: &str, enabled: bool, now: u64) -> StateResult<bool> {
        self.update_trigger(trigger_id, |t| {
            t.enabled = enabled;
            t.updated_at = now;
        })
    }

    /// Move the evaluation watermark forward to `tick` and add `skipped`
    /// to the skipped-tick counter. The watermark never moves backwards.
    /// Returns false if the trigger is unknown.
    pub fn advance_watermark(
        &self,
        trigger_id: &str,
        tick: u64,
        skipped: u64,
        now: u64,
    ) -> StateResult<bool> {
        self.update_trigger(trigger_id, |t| {
            // Only the replica that actually moves the watermark counts the skips.
            if t.last_evaluated_tick.is_none_or(|w| tick > w) {
                t.last_evaluated_tick = Some(tick);
                t.skipped_ticks += skipped;
            }
            t.updated_at = now;
        })
    }

    fn update_trigger<F>(&self, trigger_id: &str, f: F) -> StateResult<bool>
    where
        F: FnOnce(&mut Trigger),
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let found;
        {
            let mut table = txn.open_table(TRIGGERS).map_err(map_err!(Table))?;
            match read_json::<Trigger, _>(&table, trigger_id)? {
                Some(mut trigger) => {
                    f(&mut trigger);
                    write_json(&mut table, trigger_id, &trigger)?;
                    found = true;
                }
                None => found = false,
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(found)
    }

    // ── Pipelines ──────────────────────────────────────────────────

    pub fn put_pipeline(&self, pipeline: &PipelineDef) -> StateResult<()> {
        self.put_json(PIPELINES, &pipeline.id, pipeline)?;
        debug!(pipeline = %pipeline.id, blocks = pipeline.blocks.len(), "pipeline stored");
        Ok(())
    }

    pub fn get_pipeline(&self, pipeline_id: &str) -> StateResult<Option<PipelineDef>> {
        self.get_json(PIPELINES, pipeline_id)
    }

    pub fn list_pipelines(&self) -> StateResult<Vec<PipelineDef>> {
        self.list_json(PIPELINES)
    }

    pub fn delete_pipeline(&self, pipeline_id: &str) -> StateResult<bool> {
        self.delete_key(PIPELINES, pipeline_id)
    }

    // ── Runs ───────────────────────────────────────────────────────

    /// Atomically insert a run together with its block runs.
    ///
    /// For scheduled runs the (trigger, tick) pair is claimed in the same
    /// transaction; a pair with any recorded outcome yields `TickTaken`.
    /// With `exclusive` set, the insert is refused with `TriggerBusy` when
    /// the trigger already has a non-terminal run.
    pub fn insert_run(
        &self,
        run: &PipelineRun,
        blocks: &[BlockRun],
        exclusive: bool,
    ) -> StateResult<InsertOutcome> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut ticks = txn.open_table(TICKS).map_err(map_err!(Table))?;
            let mut active = txn.open_table(ACTIVE_RUNS).map_err(map_err!(Table))?;

            let claim = match (&run.trigger_id, run.tick) {
                (Some(trigger_id), Some(tick)) => Some(tick_key(trigger_id, tick)),
                _ => None,
            };
            if let Some(key) = &claim
                && read_json::<TickRecord, _>(&ticks, key)?.is_some()
            {
                return Ok(InsertOutcome::TickTaken);
            }
            if exclusive
                && let Some(trigger_id) = &run.trigger_id
                && active_run_ids(&active)?
                    .iter()
                    .any(|(_, t)| t.as_deref() == Some(trigger_id.as_str()))
            {
                return Ok(InsertOutcome::TriggerBusy);
            }

            if let Some(key) = &claim {
                write_json(&mut ticks, key, &TickRecord::Created { run_id: run.id.clone() })?;
            }
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            write_json(&mut runs, &run.id, run)?;
            if !run.status.is_terminal() {
                write_json(&mut active, &run.id, &run.trigger_id)?;
            }
            let mut block_runs = txn.open_table(BLOCK_RUNS).map_err(map_err!(Table))?;
            for block in blocks {
                write_json(&mut block_runs, &block.table_key(), block)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(run = %run.id, pipeline = %run.pipeline_id, tick = ?run.tick, "run inserted");
        Ok(InsertOutcome::Inserted)
    }

    pub fn get_run(&self, run_id: &str) -> StateResult<Option<PipelineRun>> {
        self.get_json(RUNS, run_id)
    }

    pub fn list_runs(&self) -> StateResult<Vec<PipelineRun>> {
        self.list_json(RUNS)
    }

    /// All runs created by a trigger, ordered by tick.
    pub fn list_runs_for_trigger(&self, trigger_id: &str) -> StateResult<Vec<PipelineRun>> {
        let mut runs: Vec<PipelineRun> = self
            .list_runs()?
            .into_iter()
            .filter(|r| r.trigger_id.as_deref() == Some(trigger_id))
            .collect();
        runs.sort_by_key(|r| r.tick);
        Ok(runs)
    }

    /// All non-terminal runs.
    pub fn list_active_runs(&self) -> StateResult<Vec<PipelineRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let active = txn.open_table(ACTIVE_RUNS).map_err(map_err!(Table))?;
        let runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for (run_id, _) in active_run_ids(&active)? {
            if let Some(run) = read_json(&runs, &run_id)? {
                results.push(run);
            }
        }
        Ok(results)
    }

    /// True if the trigger has at least one non-terminal run.
    pub fn has_active_run(&self, trigger_id: &str) -> StateResult<bool> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let active = txn.open_table(ACTIVE_RUNS).map_err(map_err!(Table))?;
        Ok(active_run_ids(&active)?
            .iter()
            .any(|(_, t)| t.as_deref() == Some(trigger_id)))
    }

    /// Load a run and its block runs from a consistent read snapshot.
    pub fn load_run(&self, run_id: &str) -> StateResult<Option<RunSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
        let Some(run) = read_json::<PipelineRun, _>(&runs, run_id)? else {
            return Ok(None);
        };
        let block_runs = txn.open_table(BLOCK_RUNS).map_err(map_err!(Table))?;
        let blocks = scan_prefix(&block_runs, &block_key(run_id, ""))?;
        Ok(Some(RunSnapshot { run, blocks }))
    }

    /// Apply `f` to a run and its block runs inside one write transaction.
    ///
    /// Only records the closure actually changed are written back. A run
    /// that becomes terminal leaves the active index. Fails with
    /// `RunNotFound` if the run does not exist.
    pub fn mutate_run<F, R>(&self, run_id: &str, f: F) -> StateResult<R>
    where
        F: FnOnce(&mut RunSnapshot) -> R,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let result;
        {
            let mut runs = txn.open_table(RUNS).map_err(map_err!(Table))?;
            let mut block_runs = txn.open_table(BLOCK_RUNS).map_err(map_err!(Table))?;
            let run = read_json::<PipelineRun, _>(&runs, run_id)?
                .ok_or_else(|| StateError::RunNotFound(run_id.to_string()))?;
            let blocks: Vec<BlockRun> = scan_prefix(&block_runs, &block_key(run_id, ""))?;

            let before = RunSnapshot { run, blocks };
            let mut after = before.clone();
            result = f(&mut after);

            if after.run != before.run {
                write_json(&mut runs, run_id, &after.run)?;
                if after.run.status.is_terminal() && !before.run.status.is_terminal() {
                    let mut active = txn.open_table(ACTIVE_RUNS).map_err(map_err!(Table))?;
                    active.remove(run_id).map_err(map_err!(Storage))?;
                }
            }
            for (old, new) in before.blocks.iter().zip(&after.blocks) {
                if old != new {
                    write_json(&mut block_runs, &new.table_key(), new)?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(result)
    }

    // ── Block runs ─────────────────────────────────────────────────

    pub fn get_block_run(&self, run_id: &str, block_id: &str) -> StateResult<Option<BlockRun>> {
        self.get_json(BLOCK_RUNS, &block_key(run_id, block_id))
    }

    pub fn list_block_runs(&self, run_id: &str) -> StateResult<Vec<BlockRun>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(BLOCK_RUNS).map_err(map_err!(Table))?;
        scan_prefix(&table, &block_key(run_id, ""))
    }

    /// Pending, queued and running block counts across all active runs.
    pub fn block_status_counts(&self) -> StateResult<BlockCounts> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let active = txn.open_table(ACTIVE_RUNS).map_err(map_err!(Table))?;
        let block_runs = txn.open_table(BLOCK_RUNS).map_err(map_err!(Table))?;
        let mut counts = BlockCounts::default();
        for (run_id, _) in active_run_ids(&active)? {
            let blocks: Vec<BlockRun> = scan_prefix(&block_runs, &block_key(&run_id, ""))?;
            for block in blocks {
                match block.status {
                    BlockRunStatus::Pending => counts.pending += 1,
                    BlockRunStatus::Queued => counts.queued += 1,
                    BlockRunStatus::Running => counts.running += 1,
                    _ => {}
                }
            }
        }
        Ok(counts)
    }

    // ── Ticks ──────────────────────────────────────────────────────

    pub fn get_tick(&self, trigger_id: &str, tick: u64) -> StateResult<Option<TickRecord>> {
        self.get_json(TICKS, &tick_key(trigger_id, tick))
    }

    /// Record that a tick produced no run. Returns false if the tick
    /// already has an outcome.
    pub fn record_skipped_tick(&self, trigger_id: &str, tick: u64, reason: &str) -> StateResult<bool> {
        let key = tick_key(trigger_id, tick);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let recorded;
        {
            let mut table = txn.open_table(TICKS).map_err(map_err!(Table))?;
            recorded = read_json::<TickRecord, _>(&table, &key)?.is_none();
            if recorded {
                let record = TickRecord::Skipped { reason: reason.to_string() };
                write_json(&mut table, &key, &record)?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, recorded, reason, "tick skipped");
        Ok(recorded)
    }

    // ── Coordination leases ────────────────────────────────────────

    /// Acquire the lease on `key` for `holder`, or extend it if `holder`
    /// already owns it. Returns `None` while another holder's lease is live.
    pub fn try_acquire_lease(
        &self,
        key: &str,
        holder: &str,
        now: u64,
        ttl_secs: u64,
    ) -> StateResult<Option<CoordinationLease>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let acquired;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let current = read_json::<CoordinationLease, _>(&table, key)?;
            match current {
                Some(lease) if lease.holder != holder && !lease.is_expired(now) => {
                    acquired = None;
                }
                current => {
                    let lease = CoordinationLease {
                        key: key.to_string(),
                        holder: holder.to_string(),
                        acquired_at: current
                            .filter(|l| l.holder == holder && !l.is_expired(now))
                            .map_or(now, |l| l.acquired_at),
                        expires_at: now + ttl_secs,
                    };
                    write_json(&mut table, key, &lease)?;
                    acquired = Some(lease);
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, %holder, acquired = acquired.is_some(), "lease acquisition");
        Ok(acquired)
    }

    /// Extend a live lease held by `holder`. Returns false if the lease
    /// expired or belongs to someone else.
    pub fn renew_lease(&self, key: &str, holder: &str, now: u64, ttl_secs: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let renewed;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            match read_json::<CoordinationLease, _>(&table, key)? {
                Some(mut lease) if lease.holder == holder && !lease.is_expired(now) => {
                    lease.expires_at = now + ttl_secs;
                    write_json(&mut table, key, &lease)?;
                    renewed = true;
                }
                _ => renewed = false,
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(renewed)
    }

    /// Release a lease held by `holder`. Returns false if it was not held.
    pub fn release_lease(&self, key: &str, holder: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let released;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let held = read_json::<CoordinationLease, _>(&table, key)?
                .is_some_and(|l| l.holder == holder);
            if held {
                table.remove(key).map_err(map_err!(Storage))?;
            }
            released = held;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, %holder, released, "lease released");
        Ok(released)
    }

    pub fn get_lease(&self, key: &str) -> StateResult<Option<CoordinationLease>> {
        self.get_json(LEASES, key)
    }

    /// Delete every lease that expired at or before `now`. Returns number deleted.
    pub fn reap_expired_leases(&self, now: u64) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count;
        {
            let mut table = txn.open_table(LEASES).map_err(map_err!(Table))?;
            let expired: Vec<String> = scan_all::<CoordinationLease, _>(&table)?
                .into_iter()
                .filter(|l| l.is_expired(now))
                .map(|l| l.key)
                .collect();
            for key in &expired {
                table.remove(key.as_str()).map_err(map_err!(Storage))?;
            }
            count = expired.len() as u32;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if count > 0 {
            debug!(count, "expired leases reaped");
        }
        Ok(count)
    }
}
