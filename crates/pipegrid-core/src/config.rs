//! pipegrid.toml configuration parser.
//!
//! Every section is optional; missing values fall back to the defaults
//! documented on each field.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::serde_str;
use crate::types::{ConcurrencyPolicy, ExecutorKind, FailurePolicy};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PipegridConfig {
    pub scheduler: SchedulerSettings,
    pub retry: RetrySettings,
    pub executor: ExecutorSettings,
    pub autoscale: AutoscaleSettings,
    pub pipelines: Vec<PipelineConfig>,
    pub triggers: Vec<TriggerConfig>,
}

/// Trigger evaluation and run coordination.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    /// How often each replica evaluates triggers and drives runs. Default 10s.
    #[serde(with = "serde_str")]
    pub evaluation_interval: Duration,
    /// Time-to-live of a (trigger, tick) coordination lease. Default 30s.
    #[serde(with = "serde_str")]
    pub lease_ttl: Duration,
    /// Most recent missed ticks replayed after a gap; older ones are skipped. Default 5.
    pub max_catch_up_ticks: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(10),
            lease_ttl: Duration::from_secs(30),
            max_catch_up_ticks: 5,
        }
    }
}

/// Block retry policy defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt. Default 0.
    pub max_retries: u32,
    /// Delay before the first retry; doubles per retry. Default 5s.
    #[serde(with = "serde_str")]
    pub backoff_base: Duration,
    /// Upper bound on a single retry delay. Default 5m.
    #[serde(with = "serde_str")]
    pub backoff_max: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 0,
            backoff_base: Duration::from_secs(5),
            backoff_max: Duration::from_secs(300),
        }
    }
}

/// Executor backend behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    /// Consecutive transient submit/poll failures before a block fails. Default 5.
    pub max_transient_failures: u32,
    #[serde(with = "serde_str")]
    pub transient_backoff_base: Duration,
    #[serde(with = "serde_str")]
    pub transient_backoff_max: Duration,
    /// Concurrent subprocesses for the local executor. Default 8.
    pub local_max_concurrency: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            max_transient_failures: 5,
            transient_backoff_base: Duration::from_secs(1),
            transient_backoff_max: Duration::from_secs(60),
            local_max_concurrency: 8,
        }
    }
}

/// Backlog-driven executor pool scaling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscaleSettings {
    #[serde(with = "serde_str")]
    pub interval: Duration,
    pub min_capacity: u32,
    pub max_capacity: u32,
    pub initial_capacity: u32,
    /// Scale up when the queued backlog exceeds this.
    pub high_water: u64,
    /// Scale down once the backlog stays at or below this for `scale_down_after`.
    pub low_water: u64,
    /// No scaling action within this window after the previous one.
    #[serde(with = "serde_str")]
    pub cooldown: Duration,
    #[serde(with = "serde_str")]
    pub scale_down_after: Duration,
    /// Running blocks one capacity unit can host.
    pub blocks_per_unit: u32,
}

impl Default for AutoscaleSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            min_capacity: 1,
            max_capacity: 16,
            initial_capacity: 1,
            high_water: 10,
            low_water: 2,
            cooldown: Duration::from_secs(60),
            scale_down_after: Duration::from_secs(120),
            blocks_per_unit: 1,
        }
    }
}

/// A `[[pipelines]]` entry: a static block DAG.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub id: String,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    /// Default backend for blocks that do not override it.
    #[serde(default)]
    pub executor: ExecutorKind,
    /// Overrides `[retry].max_retries` for every block of this pipeline.
    pub max_retries: Option<u32>,
    pub blocks: Vec<BlockConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockConfig {
    pub id: String,
    #[serde(default, alias = "after")]
    pub upstream: Vec<String>,
    pub executor: Option<ExecutorKind>,
    pub max_retries: Option<u32>,
    /// Shell command (local) or entrypoint (container/cluster).
    #[serde(default)]
    pub command: String,
}

/// A `[[triggers]]` entry. Exactly one of `interval` or `cron` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerConfig {
    pub id: String,
    pub pipeline: String,
    /// Fixed interval, e.g. "1m".
    pub interval: Option<String>,
    /// 5-field Unix or 6-field (with seconds) cron expression.
    pub cron: Option<String>,
    /// First eligible instant (epoch seconds). Defaults to daemon start.
    pub start_at: Option<u64>,
    pub end_at: Option<u64>,
    #[serde(default)]
    pub concurrency: ConcurrencyPolicy,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub variables: BTreeMap<String, serde_json::Value>,
}

fn default_true() -> bool {
    true
}

impl PipegridConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: PipegridConfig = toml::from_str(content)?;
        config.check_bounds()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    fn check_bounds(&self) -> anyhow::Result<()> {
        let a = &self.autoscale;
        if a.min_capacity > a.max_capacity {
            anyhow::bail!(
                "[autoscale] min_capacity ({}) exceeds max_capacity ({})",
                a.min_capacity,
                a.max_capacity
            );
        }
        if a.low_water >= a.high_water {
            anyhow::bail!(
                "[autoscale] low_water ({}) must be below high_water ({})",
                a.low_water,
                a.high_water
            );
        }
        if self.scheduler.lease_ttl.is_zero() {
            anyhow::bail!("[scheduler] lease_ttl must be non-zero");
        }
        for trigger in &self.triggers {
            if trigger.interval.is_some() == trigger.cron.is_some() {
                anyhow::bail!(
                    "trigger '{}' must set exactly one of `interval` or `cron`",
                    trigger.id
                );
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = PipegridConfig::from_toml_str("").unwrap();
        assert_eq!(config.scheduler.lease_ttl, Duration::from_secs(30));
        assert_eq!(config.scheduler.max_catch_up_ticks, 5);
        assert_eq!(config.retry.max_retries, 0);
        assert_eq!(config.autoscale.high_water, 10);
        assert!(config.pipelines.is_empty());
    }

    #[test]
    fn parses_full_file() {
        let toml_str = r#"
[scheduler]
evaluation_interval = "5s"
lease_ttl = "1m"

[retry]
max_retries = 2
backoff_base = "500ms"

[[pipelines]]
id = "etl"
failure_policy = "best_effort"
executor = "container"

[[pipelines.blocks]]
id = "load"
command = "echo load"

[[pipelines.blocks]]
id = "transform"
after = ["load"]
executor = "local"

[[triggers]]
id = "etl-hourly"
pipeline = "etl"
interval = "1h"
concurrency = "skip_if_running"

[triggers.variables]
env = "prod"
"#;
        let config = PipegridConfig::from_toml_str(toml_str).unwrap();
        assert_eq!(config.scheduler.lease_ttl, Duration::from_secs(60));
        assert_eq!(config.retry.backoff_base, Duration::from_millis(500));

        let etl = &config.pipelines[0];
        assert_eq!(etl.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(etl.executor, ExecutorKind::Container);
        assert_eq!(etl.blocks[1].upstream, vec!["load".to_string()]);
        assert_eq!(etl.blocks[1].executor, Some(ExecutorKind::Local));

        let trigger = &config.triggers[0];
        assert!(trigger.enabled);
        assert_eq!(trigger.concurrency, ConcurrencyPolicy::SkipIfRunning);
        assert_eq!(trigger.variables["env"], serde_json::json!("prod"));
    }

    #[test]
    fn rejects_inverted_water_marks() {
        let err = PipegridConfig::from_toml_str("[autoscale]\nhigh_water = 2\nlow_water = 5\n")
            .unwrap_err();
        assert!(err.to_string().contains("low_water"));
    }

    #[test]
    fn rejects_trigger_with_both_schedules() {
        let toml_str = r#"
[[triggers]]
id = "t"
pipeline = "p"
interval = "1m"
cron = "* * * * *"
"#;
        assert!(PipegridConfig::from_toml_str(toml_str).is_err());
    }

    #[test]
    fn rejects_bad_duration() {
        assert!(PipegridConfig::from_toml_str("[scheduler]\nlease_ttl = \"soon\"\n").is_err());
    }

    #[test]
    fn serializes_back_to_toml() {
        let config = PipegridConfig::default();
        let toml_str = config.to_toml_string().unwrap();
        let back = PipegridConfig::from_toml_str(&toml_str).unwrap();
        assert_eq!(back.scheduler.lease_ttl, config.scheduler.lease_ttl);
    }
}
