pub mod resources;
pub mod sync_loop;
pub mod workers;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use common::{ClusterConfig, ErrorClass};
use libbootres::BootResourceStore;
use libtgt::{ControlSocketClient, ReconcileOutcome, TargetHealth, TargetReconciler};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::migrate::{ConfigMigrator, LEGACY_PATHS};
use crate::supervisor::WorkerSupervisor;
use sync_loop::{State, SyncLoop};

/// Run the rack controller until `shutdown` resolves, then stop every
/// worker.
pub async fn run<P, F>(config_path: P, shutdown: F) -> anyhow::Result<()>
where
    P: AsRef<Path>,
    F: Future<Output = ()>,
{
    let config_path = config_path.as_ref();

    for (path, outcome) in ConfigMigrator::new(config_path)
        .migrate_all(LEGACY_PATHS)
        .context("failed to migrate legacy configuration")?
    {
        info!(path = %path.display(), %outcome, "Checked legacy configuration");
    }
    let config = ClusterConfig::load(config_path).with_context(|| {
        format!(
            "failed to load {}, run `rackd config --init` first",
            config_path.display()
        )
    })?;
    info!(
        cluster = ?config.cluster_uuid,
        region = ?config.region_url,
        workers = config.enabled_workers.len(),
        "Starting rack controller"
    );

    let store = Arc::new(
        BootResourceStore::open(&config.resource_root)
            .await
            .context("failed to open the boot resource store")?,
    );

    let daemon = Arc::new(ControlSocketClient::new(
        &config.control_socket,
        Duration::from_millis(config.target.request_timeout_ms),
    ));
    let reconciler = Arc::new(TargetReconciler::new(
        store.clone(),
        daemon,
        config.state_dir.join("tgt"),
        config.target.retry.clone(),
    ));
    match reconciler.startup().await {
        Ok(ReconcileOutcome::Applied { generation, .. }) => {
            info!(generation = ?generation, "Target daemon is up to date");
        }
        Ok(ReconcileOutcome::Failed { reason, class }) => {
            if class == ErrorClass::PermissionDenied {
                bail!("cannot configure the target daemon: {reason}");
            }
            warn!("Target daemon not configured yet, will retry: {reason}");
        }
        Err(e) => return Err(e).context("failed to restore target reconciler state"),
    }

    let supervisor = Arc::new(WorkerSupervisor::from_config(config_path, &config));
    supervisor
        .start_enabled()
        .await
        .context("failed to start enabled workers")?;

    let token = CancellationToken::new();
    let health_task = tokio::spawn(report_target_health(
        reconciler.subscribe_health(),
        token.clone(),
    ));
    let reconcile_task = tokio::spawn(reconciler.clone().run(token.clone()));
    let state = Arc::new(State::new(
        config_path,
        supervisor.clone(),
        store.clone(),
        reconciler.clone(),
    ));
    let sync_loop = SyncLoop::new(state)
        .register_event(workers::handler)
        .register_event(resources::refresh_handler)
        .register_event(resources::gc_handler);
    let loop_task = tokio::spawn(sync_loop.run(token.clone()));

    shutdown.await;
    info!("Shutting down rack controller");
    token.cancel();
    for (name, task) in [
        ("sync loop", loop_task),
        ("target reconciler", reconcile_task),
        ("target health", health_task),
    ] {
        if let Err(e) = task.await {
            error!("The {name} task failed: {e}");
        }
    }
    supervisor.shutdown().await;
    info!("Rack controller stopped");
    Ok(())
}

/// Log every change of the target daemon's health.
async fn report_target_health(mut rx: watch::Receiver<TargetHealth>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = rx.changed() => {
                if res.is_err() {
                    break;
                }
                match &*rx.borrow_and_update() {
                    TargetHealth::Ready => info!("Target daemon is serving the current generation"),
                    TargetHealth::Degraded(reason) => warn!("Target daemon degraded: {reason}"),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn test_health_reporter_follows_changes_until_shutdown() {
        let (tx, rx) = watch::channel(TargetHealth::Ready);
        let token = CancellationToken::new();
        let task = tokio::spawn(report_target_health(rx, token.clone()));

        tx.send(TargetHealth::Degraded("connection refused".to_string()))
            .unwrap();
        tx.send(TargetHealth::Ready).unwrap();
        tokio::task::yield_now().await;
        assert!(!task.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_health_reporter_stops_with_reconciler() {
        let (tx, rx) = watch::channel(TargetHealth::Ready);
        let task = tokio::spawn(report_target_health(rx, CancellationToken::new()));
        drop(tx);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
