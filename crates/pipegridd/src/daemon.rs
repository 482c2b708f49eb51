//! Daemon assembly: state store, executor backends, replicas, background tasks.

use std::path::PathBuf;
use std::sync::Arc;

use pipegrid_autoscale::{Autoscaler, ScaleFuture};
use pipegrid_core::{PipegridConfig, epoch_secs};
use pipegrid_executor::{ClusterJobExecutor, ContainerJobExecutor, Dispatcher, LocalExecutor, ProcessControlPlane};
use pipegrid_state::StateStore;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::convert::apply_config;
use crate::replica::Replica;

#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config: PipegridConfig,
    pub data_dir: PathBuf,
    /// Scheduler replicas to run in this process.
    pub replicas: usize,
    /// Replica id prefix; random when unset.
    pub replica_id: Option<String>,
}

/// Executor backends for a daemon without an external job system. Container
/// and cluster jobs run as subprocesses on the local pool.
pub fn standalone_dispatcher(local: Arc<LocalExecutor>) -> Dispatcher {
    let plane = Arc::new(ProcessControlPlane::new(Arc::clone(&local)));
    Dispatcher::new()
        .with(local)
        .with(Arc::new(ContainerJobExecutor::new(plane.clone())))
        .with(Arc::new(ClusterJobExecutor::new(plane)))
}

/// Run until Ctrl-C or until every replica has stopped.
pub async fn run_daemon(options: DaemonOptions) -> anyhow::Result<()> {
    info!("pipegrid daemon starting");

    std::fs::create_dir_all(&options.data_dir)?;
    let db_path = options.data_dir.join("pipegrid.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let config = options.config;
    apply_config(&store, &config, epoch_secs())?;

    let local = Arc::new(LocalExecutor::new(config.executor.local_max_concurrency));
    let dispatcher = Arc::new(standalone_dispatcher(Arc::clone(&local)));
    info!(backends = ?dispatcher.kinds(), "executor backends registered");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ── Start background tasks ─────────────────────────────────

    let prefix = options
        .replica_id
        .unwrap_or_else(|| format!("replica-{}", Uuid::new_v4().simple()));
    let count = options.replicas.max(1);
    let interval = config.scheduler.evaluation_interval;
    let mut replicas = JoinSet::new();
    for i in 0..count {
        let id = if count == 1 { prefix.clone() } else { format!("{prefix}-{i}") };
        let replica = Replica::new(id, store.clone(), Arc::clone(&dispatcher), &config);
        replicas.spawn(replica.run(interval, shutdown_rx.clone()));
    }
    info!(replicas = count, interval_ms = interval.as_millis() as u64, "replicas started");

    // Autoscaler resizes the local subprocess pool.
    let resize = Arc::clone(&local);
    let mut autoscaler = Autoscaler::new(store.clone(), config.autoscale.clone()).with_scale_fn(Box::new(
        move |target| -> ScaleFuture {
            resize.set_capacity(target as usize);
            Box::pin(async { Ok::<(), anyhow::Error>(()) })
        },
    ));
    let autoscale_interval = config.autoscale.interval;
    let autoscale_shutdown = shutdown_rx.clone();
    let autoscale_handle = tokio::spawn(async move {
        autoscaler.run(autoscale_interval, autoscale_shutdown).await;
    });

    // Expired coordination lease reaper.
    let reaper_store = store.clone();
    let reaper_interval = config.scheduler.lease_ttl;
    let mut reaper_shutdown = shutdown_rx.clone();
    let reaper_handle = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reaper_interval);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match reaper_store.reap_expired_leases(epoch_secs()) {
                        Ok(0) => {}
                        Ok(reaped) => info!(count = reaped, "reaped expired leases"),
                        Err(e) => warn!(error = %e, "lease reaper error"),
                    }
                }
                _ = reaper_shutdown.changed() => break,
            }
        }
    });

    // ── Wait for shutdown ──────────────────────────────────────

    let mut failed = 0usize;
    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    error!(error = %e, "failed to listen for shutdown signal");
                }
                info!("shutdown signal received");
                break;
            }
            joined = replicas.join_next() => match joined {
                Some(Ok(Ok(()))) => {}
                Some(Ok(Err(e))) => {
                    failed += 1;
                    error!(error = %e, "replica stopped");
                }
                Some(Err(e)) => {
                    failed += 1;
                    error!(error = %e, "replica task panicked");
                }
                None => {
                    error!("no replica left running");
                    break;
                }
            },
        }
    }

    let _ = shutdown_tx.send(true);
    while let Some(joined) = replicas.join_next().await {
        if let Ok(Err(e)) = joined {
            failed += 1;
            error!(error = %e, "replica stopped");
        }
    }
    let _ = autoscale_handle.await;
    let _ = reaper_handle.await;

    info!("pipegrid daemon stopped");
    if failed == count {
        anyhow::bail!("all {count} replicas stopped on state store errors");
    }
    Ok(())
}
