use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use common::{BackoffPolicy, ErrorClass, ExponentialBackoff, backoff::BackoffResult};
use libbootres::{BootResourceStore, GenerationId};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{DaemonState, TargetConfig, TargetDaemon, TargetError};

static CONFIG_FILE: &str = "targets.conf";
static APPLIED_FILE: &str = "applied.json";
static APPLYING_MARKER: &str = "applying";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The daemon serves the desired generation. `changed` is false when
    /// nothing had to be sent to it.
    Applied {
        generation: Option<GenerationId>,
        changed: bool,
    },
    Failed { reason: String, class: ErrorClass },
}

impl ReconcileOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ReconcileOutcome::Applied { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetHealth {
    Ready,
    Degraded(String),
}

/// What the daemon was last told to serve. Persisted as `applied.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AppliedState {
    generation: Option<GenerationId>,
    config_digest: String,
}

#[derive(Default)]
struct ApplyState {
    applied: Option<AppliedState>,
    /// Re-run the full apply sequence even if the digests match.
    force: bool,
}

/// Keeps the target daemon in line with the store's current generation.
///
/// Applies are serialised; the desired generation can be updated at any
/// time without waiting for an apply in flight.
pub struct TargetReconciler {
    store: Arc<BootResourceStore>,
    daemon: Arc<dyn TargetDaemon>,
    state_dir: PathBuf,
    retry: BackoffPolicy,
    desired: StdMutex<Option<GenerationId>>,
    state: Mutex<ApplyState>,
    health_tx: watch::Sender<TargetHealth>,
}

impl TargetReconciler {
    pub fn new<P: AsRef<Path>>(
        store: Arc<BootResourceStore>,
        daemon: Arc<dyn TargetDaemon>,
        state_dir: P,
        retry: BackoffPolicy,
    ) -> Self {
        let (health_tx, _) =
            watch::channel(TargetHealth::Degraded("not reconciled yet".to_string()));
        TargetReconciler {
            store,
            daemon,
            state_dir: state_dir.as_ref().to_path_buf(),
            retry,
            desired: StdMutex::new(None),
            state: Mutex::new(ApplyState::default()),
            health_tx,
        }
    }

    /// Path of the rendered target configuration handed to the daemon.
    pub fn config_path(&self) -> PathBuf {
        self.state_dir.join(CONFIG_FILE)
    }

    fn applied_path(&self) -> PathBuf {
        self.state_dir.join(APPLIED_FILE)
    }

    fn marker_path(&self) -> PathBuf {
        self.state_dir.join(APPLYING_MARKER)
    }

    pub fn health(&self) -> TargetHealth {
        self.health_tx.borrow().clone()
    }

    pub fn subscribe_health(&self) -> watch::Receiver<TargetHealth> {
        self.health_tx.subscribe()
    }

    /// Generation the daemon was last successfully configured with.
    pub async fn served_generation(&self) -> Option<GenerationId> {
        self.state
            .lock()
            .await
            .applied
            .as_ref()
            .and_then(|a| a.generation)
    }

    pub fn on_generation_changed(&self, id: GenerationId) {
        let mut desired = self.desired.lock().unwrap_or_else(|e| e.into_inner());
        if *desired != Some(id) {
            debug!(generation = %id, "Desired target generation changed");
            *desired = Some(id);
        }
    }

    /// Restore persisted state and bring the daemon in line with the store.
    ///
    /// An `applying` marker left by an interrupted apply forces the whole
    /// sequence to run again. Without a current generation an empty
    /// placeholder configuration is applied.
    pub async fn startup(&self) -> Result<ReconcileOutcome, TargetError> {
        fs::create_dir_all(&self.state_dir)
            .await
            .map_err(|e| TargetError::io(&self.state_dir, e))?;

        {
            let mut state = self.state.lock().await;
            state.applied = self.read_applied().await?;
            if fs::try_exists(self.marker_path()).await.unwrap_or(false) {
                warn!("Found an interrupted target apply, re-applying from scratch");
                state.force = true;
            }
            if let Some(g) = state.applied.as_ref().and_then(|a| a.generation) {
                if fs::try_exists(self.store.generation_path(g))
                    .await
                    .unwrap_or(false)
                {
                    self.store.hold(g);
                } else {
                    warn!(generation = %g, "Previously served generation is gone");
                    state.applied = None;
                    state.force = true;
                }
            }
        }

        *self.desired.lock().unwrap_or_else(|e| e.into_inner()) = self.store.current_generation();
        Ok(self.reconcile().await)
    }

    /// Apply the desired generation if it differs from the applied one.
    pub async fn reconcile(&self) -> ReconcileOutcome {
        let mut state = self.state.lock().await;
        let desired = *self.desired.lock().unwrap_or_else(|e| e.into_inner());

        // Pin the generation for the whole apply so GC cannot remove it.
        if let Some(g) = desired {
            self.store.hold(g);
        }
        let result = self.apply_locked(&mut state, desired).await;
        if let Some(g) = desired {
            self.store.release(g);
        }

        let outcome = match result {
            Ok(changed) => {
                self.health_tx.send_replace(TargetHealth::Ready);
                ReconcileOutcome::Applied {
                    generation: desired,
                    changed,
                }
            }
            Err(e) => {
                let class = e.class();
                let reason = e.to_string();
                warn!(generation = ?desired, ?class, "Target reconcile failed: {reason}");
                state.force = true;
                self.health_tx
                    .send_replace(TargetHealth::Degraded(reason.clone()));
                ReconcileOutcome::Failed { reason, class }
            }
        };
        drop(state);

        if matches!(outcome, ReconcileOutcome::Applied { changed: true, .. }) {
            match self.store.collect_garbage().await {
                Ok(removed) if !removed.is_empty() => {
                    debug!(?removed, "Collected generations no longer served");
                }
                Ok(_) => {}
                Err(e) => warn!("Garbage collection after apply failed: {e}"),
            }
        }
        outcome
    }

    /// Returns whether anything was sent to the daemon.
    async fn apply_locked(
        &self,
        state: &mut ApplyState,
        desired: Option<GenerationId>,
    ) -> Result<bool, TargetError> {
        let config = match desired {
            Some(g) => {
                let manifest = self.store.manifest(g).await?;
                TargetConfig::from_manifest(&manifest, &self.store.generation_path(g))
            }
            None => TargetConfig::empty(),
        };
        let next = AppliedState {
            generation: desired,
            config_digest: config.digest(),
        };
        if !state.force && state.applied.as_ref() == Some(&next) {
            debug!(generation = ?desired, "Target configuration unchanged");
            return Ok(false);
        }

        info!(generation = ?desired, luns = config.luns.len(), "Applying target configuration");
        let marker = self.marker_path();
        write_atomic(&marker, desired.map(|g| g.to_string()).unwrap_or_default().as_bytes())
            .await?;

        self.daemon.set_state(DaemonState::Offline).await?;
        let config_path = self.config_path();
        write_atomic(&config_path, config.render().as_bytes()).await?;
        self.daemon.load_config(&config_path).await?;
        self.daemon.set_state(DaemonState::Ready).await?;

        let applied_path = self.applied_path();
        let content = serde_json::to_vec_pretty(&next).map_err(|source| TargetError::State {
            path: applied_path.clone(),
            source,
        })?;
        write_atomic(&applied_path, &content).await?;
        match fs::remove_file(&marker).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(TargetError::io(&marker, e)),
        }

        // Hand the served generation over: hold the new one before letting
        // go of the old one.
        let previous = state.applied.as_ref().and_then(|a| a.generation);
        if let Some(g) = desired
            && previous != desired
        {
            self.store.hold(g);
        }
        if let Some(g) = previous
            && previous != desired
        {
            self.store.release(g);
        }

        state.applied = Some(next);
        state.force = false;
        info!(generation = ?desired, "Target daemon is serving the current generation");
        Ok(true)
    }

    async fn read_applied(&self) -> Result<Option<AppliedState>, TargetError> {
        let path = self.applied_path();
        let content = match fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(TargetError::io(&path, e)),
        };
        match serde_json::from_slice(&content) {
            Ok(applied) => Ok(Some(applied)),
            Err(e) => {
                warn!("Ignoring unreadable {path:?}: {e}");
                Ok(None)
            }
        }
    }

    /// Follow the store's current pointer until `shutdown` fires.
    ///
    /// Failed applies are retried on the configured backoff schedule, except
    /// permission errors, which wait for the next generation change.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut rx = self.store.subscribe();
        let mut backoff = ExponentialBackoff::new(self.retry.clone());

        loop {
            if let Some(g) = rx.borrow_and_update().generation {
                self.on_generation_changed(g);
            }

            let retry_after = match self.reconcile().await {
                ReconcileOutcome::Applied { .. } => {
                    backoff.reset();
                    None
                }
                ReconcileOutcome::Failed { reason, class } => {
                    if class == ErrorClass::PermissionDenied {
                        error!("Target daemon cannot be configured: {reason}");
                        None
                    } else {
                        match backoff.end_attempt_failed() {
                            BackoffResult::StartAfter(delay) => {
                                debug!(?delay, attempt = backoff.attempts(), "Retrying target apply");
                                Some(delay)
                            }
                            BackoffResult::Stop => {
                                error!(
                                    attempts = backoff.attempts(),
                                    "Giving up on target apply until the generation changes"
                                );
                                None
                            }
                        }
                    }
                }
            };

            match retry_after {
                Some(delay) => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        res = rx.changed() => {
                            if res.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        res = rx.changed() => {
                            if res.is_err() {
                                break;
                            }
                            backoff.reset();
                        }
                    }
                }
            }
        }
        info!("Target reconciler stopped");
    }
}

async fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TargetError> {
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    let mut file = fs::File::create(&tmp)
        .await
        .map_err(|e| TargetError::io(&tmp, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| TargetError::io(&tmp, e))?;
    file.sync_all()
        .await
        .map_err(|e| TargetError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path)
        .await
        .map_err(|e| TargetError::io(path, e))
}
