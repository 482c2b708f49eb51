//! Autoscaler — backlog-driven executor pool scaling.
//!
//! Observes the queued backlog and the running block count, decides on a
//! target pool capacity, and hands it to a callback that resizes the
//! executor backend.

use std::time::Duration;

use pipegrid_core::{AutoscaleSettings, epoch_secs};
use pipegrid_state::StateStore;
use tracing::{debug, info, warn};

/// A scaling decision for the executor pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Resize the pool to this capacity.
    ScaleTo(u32),
    NoChange,
}

/// One observation of the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySample {
    /// Queued block runs not yet running.
    pub backlog: u64,
    pub running: u64,
    pub capacity: u32,
}

/// Callback type for performing scaling actions.
///
/// The autoscaler calls this with the target capacity.
pub type ScaleCallback = Box<dyn Fn(u32) -> ScaleFuture + Send + Sync>;

pub type ScaleFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

pub struct Autoscaler {
    state: StateStore,
    settings: AutoscaleSettings,
    capacity: u32,
    last_action_at: Option<u64>,
    /// Start of the current run of samples at or below the low-water mark.
    low_since: Option<u64>,
    scale_fn: Option<ScaleCallback>,
}

impl Autoscaler {
    pub fn new(state: StateStore, settings: AutoscaleSettings) -> Self {
        let capacity = settings
            .initial_capacity
            .clamp(settings.min_capacity, settings.max_capacity.max(settings.min_capacity));
        Self {
            state,
            settings,
            capacity,
            last_action_at: None,
            low_since: None,
            scale_fn: None,
        }
    }

    /// Set the callback used to perform scaling.
    pub fn with_scale_fn(mut self, f: ScaleCallback) -> Self {
        self.scale_fn = Some(f);
        self
    }

    /// Capacity as last applied.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn floor(&self, running: u64) -> u32 {
        let per_unit = u64::from(self.settings.blocks_per_unit.max(1));
        let needed = running.div_ceil(per_unit).min(u64::from(u32::MAX)) as u32;
        needed
            .max(self.settings.min_capacity)
            .min(self.max_capacity())
    }

    fn max_capacity(&self) -> u32 {
        self.settings.max_capacity.max(self.settings.min_capacity)
    }

    /// Decide on a target capacity for one sample.
    pub fn evaluate(&mut self, sample: CapacitySample, now: u64) -> ScaleDecision {
        let (high, low) = (self.settings.high_water, self.settings.low_water);
        if sample.backlog <= low {
            self.low_since.get_or_insert(now);
        } else {
            self.low_since = None;
        }

        let cooldown = self.settings.cooldown.as_secs();
        if self.last_action_at.is_some_and(|at| now < at + cooldown) {
            return ScaleDecision::NoChange;
        }

        let capacity = sample.capacity;
        let floor = self.floor(sample.running);
        let target = if capacity < floor || capacity > self.max_capacity() {
            capacity.clamp(floor, self.max_capacity())
        } else if sample.backlog > high {
            let high = high.max(1);
            let over = sample.backlog - high;
            let step = (u64::from(capacity) * over).div_ceil(high).max(1);
            let step = step.min(u64::from(u32::MAX)) as u32;
            capacity.saturating_add(step).min(self.max_capacity())
        } else if self
            .low_since
            .is_some_and(|since| now.saturating_sub(since) >= self.settings.scale_down_after.as_secs())
            && capacity > floor
        {
            floor + (capacity - floor) / 2
        } else {
            capacity
        };

        if target == capacity {
            return ScaleDecision::NoChange;
        }
        self.last_action_at = Some(now);
        if target < capacity {
            // A further scale-down needs another full low-water window.
            self.low_since = Some(now);
        }
        debug!(
            from = capacity,
            to = target,
            backlog = sample.backlog,
            running = sample.running,
            "scaling decision"
        );
        ScaleDecision::ScaleTo(target)
    }

    /// Sample the state store, decide, and apply the decision.
    pub async fn evaluate_all(&mut self, now: u64) -> anyhow::Result<ScaleDecision> {
        let counts = self.state.block_status_counts()?;
        let sample = CapacitySample {
            backlog: counts.queued,
            running: counts.running,
            capacity: self.capacity,
        };
        let decision = self.evaluate(sample, now);

        if let ScaleDecision::ScaleTo(target) = decision {
            match &self.scale_fn {
                Some(scale_fn) => match scale_fn(target).await {
                    Ok(()) => self.capacity = target,
                    Err(e) => warn!(target, error = %e, "scaling action failed"),
                },
                None => self.capacity = target,
            }
            info!(
                capacity = self.capacity,
                backlog = sample.backlog,
                running = sample.running,
                "executor pool scaled"
            );
        }
        Ok(decision)
    }

    /// Run the autoscaler loop.
    pub async fn run(&mut self, interval: Duration, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = interval.as_secs(),
            capacity = self.capacity,
            "autoscaler started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.evaluate_all(epoch_secs()).await {
                        tracing::error!(error = %e, "autoscaler evaluation failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("autoscaler shutting down");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use pipegrid_state::{BlockDef, BlockRun, BlockRunStatus, ExecutorKind, PipelineRun};

    use super::*;

    fn settings() -> AutoscaleSettings {
        AutoscaleSettings {
            interval: Duration::from_secs(10),
            min_capacity: 1,
            max_capacity: 8,
            initial_capacity: 1,
            high_water: 10,
            low_water: 2,
            cooldown: Duration::from_secs(20),
            scale_down_after: Duration::from_secs(20),
            blocks_per_unit: 1,
        }
    }

    fn scaler() -> Autoscaler {
        Autoscaler::new(StateStore::open_in_memory().unwrap(), settings())
    }

    fn sample(backlog: u64, running: u64, capacity: u32) -> CapacitySample {
        CapacitySample {
            backlog,
            running,
            capacity,
        }
    }

    #[test]
    fn backlog_sequence_scales_up_once_and_down_once() {
        let mut scaler = scaler();
        let mut capacity = 1;
        let mut ups = 0;
        let mut downs = 0;

        for (i, backlog) in [0, 15, 15, 1, 1, 1].into_iter().enumerate() {
            let now = i as u64 * 10;
            if let ScaleDecision::ScaleTo(target) = scaler.evaluate(sample(backlog, 0, capacity), now) {
                if target > capacity {
                    ups += 1;
                } else {
                    downs += 1;
                }
                capacity = target;
            }
        }

        assert_eq!((ups, downs), (1, 1));
        assert_eq!(capacity, 1);
    }

    #[test]
    fn proportional_step_is_bounded_by_max() {
        let mut scaler = scaler();
        // 4 * (30 - 10) / 10 = 8 -> 12, capped at 8.
        assert_eq!(scaler.evaluate(sample(30, 4, 4), 0), ScaleDecision::ScaleTo(8));
        let mut scaler = self::scaler();
        // Just over the mark still steps by one.
        assert_eq!(scaler.evaluate(sample(11, 0, 2), 0), ScaleDecision::ScaleTo(3));
    }

    #[test]
    fn cooldown_blocks_consecutive_actions() {
        let mut scaler = scaler();
        assert_eq!(scaler.evaluate(sample(20, 0, 1), 0), ScaleDecision::ScaleTo(2));
        assert_eq!(scaler.evaluate(sample(40, 0, 2), 10), ScaleDecision::NoChange);
        assert!(matches!(scaler.evaluate(sample(40, 0, 2), 20), ScaleDecision::ScaleTo(n) if n > 2));
    }

    #[test]
    fn never_scales_below_running_floor() {
        let mut scaler = scaler();
        assert_eq!(scaler.evaluate(sample(0, 6, 8), 0), ScaleDecision::NoChange);
        // Halves the excess above the 6 running blocks.
        assert_eq!(scaler.evaluate(sample(0, 6, 8), 20), ScaleDecision::ScaleTo(7));
        assert_eq!(scaler.evaluate(sample(0, 7, 7), 60), ScaleDecision::NoChange);
    }

    #[test]
    fn rising_backlog_resets_low_water_streak() {
        let mut scaler = scaler();
        assert_eq!(scaler.evaluate(sample(0, 0, 4), 0), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(sample(5, 0, 4), 10), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(sample(0, 0, 4), 20), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(sample(0, 0, 4), 30), ScaleDecision::NoChange);
        assert_eq!(scaler.evaluate(sample(0, 0, 4), 40), ScaleDecision::ScaleTo(2));
    }

    #[tokio::test]
    async fn evaluate_all_reads_backlog_and_calls_back() {
        let state = StateStore::open_in_memory().unwrap();
        let run = PipelineRun {
            id: "run-1".to_string(),
            pipeline_id: "p".to_string(),
            trigger_id: None,
            tick: None,
            status: pipegrid_state::PipelineRunStatus::Running,
            failure_policy: Default::default(),
            variables: Default::default(),
            cancel_requested: false,
            created_at: 0,
            started_at: Some(0),
            finished_at: None,
        };
        let blocks: Vec<BlockRun> = (0..12)
            .map(|i| {
                let def = BlockDef {
                    id: format!("b{i}"),
                    upstream: vec![],
                    executor: ExecutorKind::Local,
                    max_retries: 0,
                    command: String::new(),
                };
                let mut block = BlockRun::pending(&run.id, &def, 0);
                block.status = BlockRunStatus::Queued;
                block
            })
            .collect();
        state.insert_run(&run, &blocks, false).unwrap();

        let applied = Arc::new(AtomicU32::new(0));
        let seen = Arc::clone(&applied);
        let mut scaler = Autoscaler::new(state, settings()).with_scale_fn(Box::new(move |target| -> ScaleFuture {
            seen.store(target, Ordering::SeqCst);
            Box::pin(async { Ok::<(), anyhow::Error>(()) })
        }));

        assert_eq!(scaler.evaluate_all(100).await.unwrap(), ScaleDecision::ScaleTo(2));
        assert_eq!(applied.load(Ordering::SeqCst), 2);
        assert_eq!(scaler.capacity(), 2);
    }

    #[tokio::test]
    async fn failed_callback_keeps_capacity() {
        let state = StateStore::open_in_memory().unwrap();
        let mut settings = settings();
        settings.initial_capacity = 4;
        let mut scaler = Autoscaler::new(state, settings)
            .with_scale_fn(Box::new(|_| -> ScaleFuture {
                Box::pin(async { Err::<(), _>(anyhow::anyhow!("api down")) })
            }));

        scaler.evaluate_all(0).await.unwrap();
        assert_eq!(scaler.evaluate_all(20).await.unwrap(), ScaleDecision::ScaleTo(2));
        assert_eq!(scaler.capacity(), 4);
    }
}
