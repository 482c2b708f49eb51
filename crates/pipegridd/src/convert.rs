//! Config file entries to persisted definitions.

use anyhow::{Context, bail};
use pipegrid_core::{PipegridConfig, PipelineConfig, RetrySettings, TriggerConfig, parse_duration_secs};
use pipegrid_scheduler::BlockGraph;
use pipegrid_state::{BlockDef, PipelineDef, Schedule, StateStore, Trigger};
use pipegrid_trigger::validate_cron;
use tracing::info;

/// Resolve per-block executor and retry budget against pipeline and global defaults.
pub fn pipeline_def(config: &PipelineConfig, retry: &RetrySettings) -> PipelineDef {
    let blocks = config
        .blocks
        .iter()
        .map(|block| BlockDef {
            id: block.id.clone(),
            upstream: block.upstream.clone(),
            executor: block.executor.unwrap_or(config.executor),
            max_retries: block
                .max_retries
                .or(config.max_retries)
                .unwrap_or(retry.max_retries),
            command: block.command.clone(),
        })
        .collect();
    PipelineDef {
        id: config.id.clone(),
        failure_policy: config.failure_policy,
        blocks,
    }
}

/// Build a trigger from its config entry. Without an explicit `start_at`
/// the stored trigger's start is kept, so restarts do not move the schedule.
pub fn trigger_from_config(config: &TriggerConfig, existing: Option<&Trigger>, now: u64) -> anyhow::Result<Trigger> {
    let schedule = match (&config.interval, &config.cron) {
        (Some(interval), None) => {
            let every_secs = parse_duration_secs(interval)
                .with_context(|| format!("trigger '{}': bad interval", config.id))?;
            if every_secs == 0 {
                bail!("trigger '{}': interval must be at least one second", config.id);
            }
            Schedule::Interval { every_secs }
        }
        (None, Some(expression)) => {
            validate_cron(expression).with_context(|| format!("trigger '{}'", config.id))?;
            Schedule::Cron {
                expression: expression.clone(),
            }
        }
        _ => bail!("trigger '{}' must set exactly one of `interval` or `cron`", config.id),
    };

    let start_at = config
        .start_at
        .or(existing.map(|t| t.start_at))
        .unwrap_or(now);
    if let Some(end_at) = config.end_at
        && end_at < start_at
    {
        bail!("trigger '{}': end_at precedes start_at", config.id);
    }

    Ok(Trigger {
        id: config.id.clone(),
        pipeline_id: config.pipeline.clone(),
        schedule,
        start_at,
        end_at: config.end_at,
        concurrency: config.concurrency,
        enabled: config.enabled,
        variables: config.variables.clone(),
        last_evaluated_tick: None,
        skipped_ticks: 0,
        created_at: now,
        updated_at: now,
    })
}

/// Check every pipeline DAG and trigger without touching any state.
pub fn validate_config(config: &PipegridConfig) -> anyhow::Result<()> {
    for pipeline in &config.pipelines {
        BlockGraph::from_pipeline(&pipeline_def(pipeline, &config.retry))
            .with_context(|| format!("pipeline '{}'", pipeline.id))?;
    }
    for trigger in &config.triggers {
        if !config.pipelines.iter().any(|p| p.id == trigger.pipeline) {
            bail!(
                "trigger '{}' references unknown pipeline '{}'",
                trigger.id,
                trigger.pipeline
            );
        }
        trigger_from_config(trigger, None, 0)?;
    }
    Ok(())
}

/// Upsert all pipelines and triggers from the config file.
pub fn apply_config(store: &StateStore, config: &PipegridConfig, now: u64) -> anyhow::Result<()> {
    validate_config(config)?;
    for pipeline in &config.pipelines {
        store.put_pipeline(&pipeline_def(pipeline, &config.retry))?;
    }
    for entry in &config.triggers {
        let existing = store.get_trigger(&entry.id)?;
        let trigger = trigger_from_config(entry, existing.as_ref(), now)?;
        let synced = store.sync_trigger(&trigger)?;
        info!(
            trigger = %synced.id,
            pipeline = %synced.pipeline_id,
            start_at = synced.start_at,
            watermark = ?synced.last_evaluated_tick,
            "trigger loaded"
        );
    }
    info!(
        pipelines = config.pipelines.len(),
        triggers = config.triggers.len(),
        "configuration applied"
    );
    Ok(())
}
