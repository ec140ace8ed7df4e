use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::daemon::sync_loop::{Event, State, WithEvent};

/// Look for a `current` pointer swapped by another process every ten
/// seconds.
pub struct RefreshCurrentGeneration;

impl Event<()> for RefreshCurrentGeneration {
    fn listen() -> Pin<Box<dyn Future<Output = ()> + Send>> {
        async {
            sleep(Duration::from_secs(10)).await;
        }
        .boxed()
    }
}

/// Publishing a moved pointer wakes the target reconciler.
pub async fn refresh_handler(
    state: Arc<State>,
    _data: Box<()>,
    _event: WithEvent<RefreshCurrentGeneration>,
) {
    if let Err(e) = state.store().refresh().await {
        error!("Failed to refresh the current boot resource generation: {e}");
    }
}

/// Sweep superseded generations every ten minutes.
pub struct CollectGenerations;

impl Event<()> for CollectGenerations {
    fn listen() -> Pin<Box<dyn Future<Output = ()> + Send>> {
        async {
            sleep(Duration::from_secs(600)).await;
        }
        .boxed()
    }
}

/// Only generations neither current nor served by the target daemon go.
pub async fn gc_handler(state: Arc<State>, _data: Box<()>, _event: WithEvent<CollectGenerations>) {
    match state.store().collect_garbage().await {
        Ok(removed) if !removed.is_empty() => {
            info!(count = removed.len(), "Removed superseded boot resource generations");
        }
        Ok(_) => {}
        Err(e) => warn!("Boot resource garbage collection failed: {e}"),
    }
    if let Some(served) = state.reconciler().served_generation().await
        && state.store().current_generation() != Some(served)
    {
        info!(generation = %served, "Target daemon still serves an older generation");
    }
}
