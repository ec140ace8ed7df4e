use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use common::ClusterConfig;
use futures::FutureExt;
use tokio::time::sleep;
use tracing::{debug, error};

use crate::daemon::sync_loop::{Event, State, WithEvent};

/// Re-read the enabled worker set every five seconds.
pub struct SyncEnabledWorkers;

impl Event<()> for SyncEnabledWorkers {
    fn listen() -> Pin<Box<dyn Future<Output = ()> + Send>> {
        async {
            sleep(Duration::from_secs(5)).await;
        }
        .boxed()
    }
}

/// Start workers enabled since the last tick and stop the disabled ones,
/// as written to the configuration file by `rackd workers enable|disable`.
/// - A configuration that fails to load is logged and the tick skipped.
pub async fn handler(state: Arc<State>, _data: Box<()>, _event: WithEvent<SyncEnabledWorkers>) {
    let Some(_guard) = state.try_lock_worker_sync() else {
        debug!("Previous worker sync still running, skipping");
        return;
    };
    let config = match ClusterConfig::load(state.config_path()) {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to re-read enabled workers: {e}");
            return;
        }
    };
    match state.supervisor().sync_enabled(&config.enabled_workers).await {
        Ok(outcome) if outcome.changed() => debug!("Worker set synced"),
        Ok(_) => {}
        Err(e) => error!("Failed to sync workers: {e}"),
    }
}
