//! One scheduler replica: evaluate triggers, coordinate runs, drive runs.

use std::sync::Arc;
use std::time::Duration;

use pipegrid_coordinator::RunCoordinator;
use pipegrid_core::{PipegridConfig, epoch_secs};
use pipegrid_executor::{BackoffTracker, Dispatcher};
use pipegrid_scheduler::{DagEngine, DriverReport, RetryPolicy, RunDriver};
use pipegrid_state::StateStore;
use pipegrid_trigger::{EvaluationReport, TriggerEvaluator};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Outcome of one replica pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaReport {
    pub evaluation: EvaluationReport,
    pub driver: DriverReport,
}

pub struct Replica {
    id: String,
    evaluator: TriggerEvaluator,
    coordinator: RunCoordinator,
    driver: RunDriver,
}

impl Replica {
    pub fn new(id: impl Into<String>, store: StateStore, dispatcher: Arc<Dispatcher>, config: &PipegridConfig) -> Self {
        let id = id.into();
        let scheduler = &config.scheduler;
        let lease_ttl = scheduler.lease_ttl.as_secs().max(1);
        let engine = DagEngine::new(store.clone(), RetryPolicy::from_settings(&config.retry));
        Self {
            evaluator: TriggerEvaluator::new(store.clone(), scheduler.max_catch_up_ticks),
            coordinator: RunCoordinator::new(store, id.clone(), lease_ttl),
            driver: RunDriver::new(engine, dispatcher, BackoffTracker::from_settings(&config.executor)),
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn coordinator(&self) -> &RunCoordinator {
        &self.coordinator
    }

    pub fn driver(&self) -> &RunDriver {
        &self.driver
    }

    /// One pass: hand due ticks to the coordinator, then advance active runs.
    pub async fn tick(&mut self, now: u64) -> anyhow::Result<ReplicaReport> {
        let evaluation = self.evaluator.evaluate_all(&self.coordinator, now)?;
        let driver = self.driver.tick(now).await?;
        Ok(ReplicaReport { evaluation, driver })
    }

    /// Run passes on `interval` until shutdown. A pass failure means the
    /// state store is unusable: the replica stops and returns the error.
    pub async fn run(mut self, interval: Duration, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        info!(replica = %self.id, interval_ms = interval.as_millis() as u64, "replica started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.tick(epoch_secs()).await {
                        Ok(report) => {
                            if report != ReplicaReport::default() {
                                debug!(replica = %self.id, ?report, "replica pass");
                            }
                        }
                        Err(e) => {
                            error!(replica = %self.id, error = %e, "state store unavailable, replica stepping back");
                            return Err(e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    info!(replica = %self.id, "replica shutting down");
                    return Ok(());
                }
            }
        }
    }
}
