//! Region worker supervision.
//!
//! Every started worker slot gets a monitor task that owns its process and
//! runs the slot's state machine:
//!
//! ```text
//!   Stopped -> Starting -> Running
//!                 |           |
//!                 v           v
//!               Failed <------+   (restart after backoff, or stay Failed
//!                                  once the attempt budget is spent)
//! ```
//!
//! The supervisor itself only keeps handles to those tasks. Its map lock is
//! never held while waiting for a process to exit; `start` and `stop` of one
//! slot are serialised by a per-slot async lock instead.

mod launcher;
mod monitor;

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::config::WorkerConfig;
use common::{BackoffPolicy, ClusterConfig, ConfigError, ErrorClass, ExponentialBackoff, Outcome, WorkerId};
use futures::future::join_all;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use launcher::{CommandLauncher, WorkerLauncher};
use monitor::Monitor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerStatus {
    Stopped,
    Starting,
    Running,
    Failed(String),
}

impl WorkerStatus {
    fn is_active(&self) -> bool {
        matches!(self, WorkerStatus::Starting | WorkerStatus::Running)
    }
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Stopped => write!(f, "stopped"),
            WorkerStatus::Starting => write!(f, "starting"),
            WorkerStatus::Running => write!(f, "running"),
            WorkerStatus::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to start worker {id}: {source}")]
    Spawn {
        id: WorkerId,
        #[source]
        source: io::Error,
    },

    #[error("worker identities start at 1")]
    InvalidWorker,
}

impl SupervisorError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SupervisorError::Config(e) => e.class(),
            SupervisorError::Spawn { source, .. }
                if source.kind() == io::ErrorKind::PermissionDenied =>
            {
                ErrorClass::PermissionDenied
            }
            SupervisorError::Spawn { .. } => ErrorClass::ProcessCrash,
            SupervisorError::InvalidWorker => ErrorClass::Fatal,
        }
    }
}

struct WorkerHandle {
    status: watch::Receiver<WorkerStatus>,
    pid: Arc<AtomicU32>,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl WorkerHandle {
    /// Cancel the monitor and wait for it to bring the process down.
    async fn shutdown(self, id: WorkerId, grace_period: Duration) {
        self.stop.cancel();
        // The monitor escalates to SIGKILL itself after the grace period.
        let budget = grace_period + Duration::from_secs(5);
        match timeout(budget, self.task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(worker = %id, "Worker monitor panicked: {e}"),
            Err(_) => warn!(worker = %id, "Worker monitor did not finish in {budget:?}"),
        }
    }
}

pub struct WorkerSupervisor {
    config_path: PathBuf,
    launcher: Arc<dyn WorkerLauncher>,
    restart: BackoffPolicy,
    startup_timeout: Duration,
    grace_period: Duration,
    workers: Mutex<BTreeMap<WorkerId, WorkerHandle>>,
    slots: Mutex<BTreeMap<WorkerId, Arc<AsyncMutex<()>>>>,
}

impl WorkerSupervisor {
    /// `config_path` is where enable/disable persist the desired worker set.
    pub fn new<P: AsRef<Path>>(
        config_path: P,
        worker: &WorkerConfig,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        WorkerSupervisor {
            config_path: config_path.as_ref().to_path_buf(),
            launcher,
            restart: worker.restart.clone(),
            startup_timeout: Duration::from_millis(worker.startup_timeout_ms),
            grace_period: Duration::from_millis(worker.grace_period_ms),
            workers: Mutex::new(BTreeMap::new()),
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    /// Supervisor launching the configured worker program.
    pub fn from_config<P: AsRef<Path>>(config_path: P, config: &ClusterConfig) -> Self {
        let launcher = Arc::new(
            CommandLauncher::new(&config.worker)
                .with_shared_secret(config.shared_secret_path.clone()),
        );
        Self::new(config_path, &config.worker, launcher)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<WorkerId, WorkerHandle>> {
        self.workers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, id: WorkerId) -> Arc<AsyncMutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(id).or_default().clone()
    }

    pub fn status(&self, id: WorkerId) -> WorkerStatus {
        match self.lock().get(&id) {
            Some(handle) => handle.status.borrow().clone(),
            None => WorkerStatus::Stopped,
        }
    }

    /// Pid of the worker's current process, if it has one.
    pub fn pid(&self, id: WorkerId) -> Option<u32> {
        self.lock()
            .get(&id)
            .map(|h| h.pid.load(Ordering::SeqCst))
            .filter(|pid| *pid != 0)
    }

    /// Every started worker slot with its status.
    pub fn workers(&self) -> Vec<(WorkerId, WorkerStatus)> {
        self.lock()
            .iter()
            .map(|(id, h)| (*id, h.status.borrow().clone()))
            .collect()
    }

    /// Receiver following the status of a started worker.
    pub fn watch(&self, id: WorkerId) -> Option<watch::Receiver<WorkerStatus>> {
        self.lock().get(&id).map(|h| h.status.clone())
    }

    /// Persist `id` as enabled, then start it.
    pub async fn enable(&self, id: WorkerId) -> Result<Outcome, SupervisorError> {
        if id.0 == 0 {
            return Err(SupervisorError::InvalidWorker);
        }
        let persisted = ClusterConfig::update(&self.config_path, |cfg| {
            cfg.enabled_workers.insert(id);
        })?;
        let started = self.start(id).await?;
        if persisted.changed() {
            info!(worker = %id, "Worker enabled");
        }
        Ok(combine(persisted, started))
    }

    /// Persist `id` as disabled, then stop it. Other workers are untouched.
    pub async fn disable(&self, id: WorkerId) -> Result<Outcome, SupervisorError> {
        let persisted = ClusterConfig::update(&self.config_path, |cfg| {
            cfg.enabled_workers.remove(&id);
        })?;
        let stopped = self.stop(id).await;
        if persisted.changed() {
            info!(worker = %id, "Worker disabled");
        }
        Ok(combine(persisted, stopped))
    }

    /// Start the worker unless it is already starting or running. A worker
    /// that is failed, including one waiting to be restarted, is started
    /// afresh with a clean attempt counter.
    pub async fn start(&self, id: WorkerId) -> Result<Outcome, SupervisorError> {
        if id.0 == 0 {
            return Err(SupervisorError::InvalidWorker);
        }
        let slot = self.slot(id);
        let _slot = slot.lock().await;
        let previous = {
            let mut workers = self.lock();
            if workers
                .get(&id)
                .is_some_and(|h| h.status.borrow().is_active())
            {
                return Ok(Outcome::NoOp);
            }
            workers.remove(&id)
        };
        if let Some(previous) = previous {
            previous.shutdown(id, self.grace_period).await;
        }

        let handle = self.spawn_monitor(id);
        let replaced = self.lock().insert(id, handle);
        if let Some(other) = replaced {
            other.shutdown(id, self.grace_period).await;
        }
        debug!(worker = %id, "Worker monitor started");
        Ok(Outcome::Changed)
    }

    /// SIGTERM, then SIGKILL after the grace period. Also cancels a pending
    /// restart.
    pub async fn stop(&self, id: WorkerId) -> Outcome {
        let slot = self.slot(id);
        let _slot = slot.lock().await;
        let handle = self.lock().remove(&id);
        match handle {
            Some(handle) => {
                handle.shutdown(id, self.grace_period).await;
                Outcome::Changed
            }
            None => Outcome::NoOp,
        }
    }

    /// Start every worker enabled in the configuration file.
    pub async fn start_enabled(&self) -> Result<Outcome, SupervisorError> {
        let config = ClusterConfig::load_or_default(&self.config_path)?;
        let mut outcome = Outcome::NoOp;
        for id in config.enabled_workers {
            outcome = combine(outcome, self.start(id).await?);
        }
        Ok(outcome)
    }

    /// Bring the started workers in line with `enabled`: start the newly
    /// enabled ones and stop the ones no longer listed. Running workers in
    /// the set are left alone, and so are workers that stay failed after
    /// spending their restart budget.
    pub async fn sync_enabled(&self, enabled: &BTreeSet<WorkerId>) -> Result<Outcome, SupervisorError> {
        let (to_stop, to_start): (Vec<_>, Vec<_>) = {
            let workers = self.lock();
            let to_stop = workers
                .keys()
                .filter(|id| !enabled.contains(id))
                .copied()
                .collect();
            let to_start = enabled
                .iter()
                .filter(|id| !workers.contains_key(id))
                .copied()
                .collect();
            (to_stop, to_start)
        };

        let mut outcome = Outcome::NoOp;
        for id in to_stop {
            info!(worker = %id, "Worker no longer enabled, stopping it");
            outcome = combine(outcome, self.stop(id).await);
        }
        for id in to_start {
            info!(worker = %id, "Worker newly enabled, starting it");
            outcome = combine(outcome, self.start(id).await?);
        }
        Ok(outcome)
    }

    /// Stop every worker concurrently.
    pub async fn shutdown(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.lock()).into_iter().collect();
        if handles.is_empty() {
            return;
        }
        info!(count = handles.len(), "Stopping all workers");
        join_all(
            handles
                .into_iter()
                .map(|(id, handle)| handle.shutdown(id, self.grace_period)),
        )
        .await;
    }

    fn spawn_monitor(&self, id: WorkerId) -> WorkerHandle {
        let (status_tx, status) = watch::channel(WorkerStatus::Starting);
        let pid = Arc::new(AtomicU32::new(0));
        let stop = CancellationToken::new();
        let monitor = Monitor {
            id,
            launcher: self.launcher.clone(),
            status_tx,
            pid: pid.clone(),
            stop: stop.clone(),
            startup_timeout: self.startup_timeout,
            grace_period: self.grace_period,
            backoff: ExponentialBackoff::new(self.restart.clone()),
        };
        let task = tokio::spawn(monitor.run());
        WorkerHandle {
            status,
            pid,
            stop,
            task,
        }
    }
}

fn combine(a: Outcome, b: Outcome) -> Outcome {
    if a.changed() || b.changed() {
        Outcome::Changed
    } else {
        Outcome::NoOp
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;
    use std::sync::atomic::AtomicUsize;
    use tempfile::tempdir;
    use tokio::process::{Child, Command};

    /// Launches `sleep`, ready as soon as it was spawned.
    #[derive(Default)]
    struct SleepLauncher {
        spawned: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl WorkerLauncher for SleepLauncher {
        fn spawn(&self, id: WorkerId) -> Result<Child, SupervisorError> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Command::new("sleep")
                .arg("600")
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| SupervisorError::Spawn { id, source })
        }

        async fn is_ready(&self, _id: WorkerId) -> bool {
            true
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            startup_timeout_ms: 2_000,
            grace_period_ms: 500,
            restart: BackoffPolicy {
                base_ms: 20,
                max_ms: 100,
                jitter_ms: 0,
                max_attempts: 2,
                cooldown_ms: 60_000,
            },
            ..Default::default()
        }
    }

    async fn wait_for(sup: &WorkerSupervisor, id: WorkerId, want: fn(&WorkerStatus) -> bool) {
        let mut rx = sup.watch(id).expect("worker not started");
        timeout(Duration::from_secs(5), async {
            while !want(&rx.borrow_and_update()) {
                rx.changed().await.unwrap();
            }
        })
        .await
        .expect("timed out waiting for worker status");
    }

    #[tokio::test]
    async fn test_enable_persists_and_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rackd.yaml");
        let launcher = Arc::new(SleepLauncher::default());
        let sup = WorkerSupervisor::new(&path, &worker_config(), launcher.clone());

        assert_eq!(sup.enable(WorkerId(2)).await.unwrap(), Outcome::Changed);
        assert!(ClusterConfig::load(&path)
            .unwrap()
            .enabled_workers
            .contains(&WorkerId(2)));
        wait_for(&sup, WorkerId(2), |s| *s == WorkerStatus::Running).await;

        assert_eq!(sup.enable(WorkerId(2)).await.unwrap(), Outcome::NoOp);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);

        assert_eq!(sup.disable(WorkerId(2)).await.unwrap(), Outcome::Changed);
        assert_eq!(sup.status(WorkerId(2)), WorkerStatus::Stopped);
        assert!(ClusterConfig::load(&path).unwrap().enabled_workers.is_empty());
        assert_eq!(sup.disable(WorkerId(2)).await.unwrap(), Outcome::NoOp);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_starts_spawn_one_process() {
        let dir = tempdir().unwrap();
        let launcher = Arc::new(SleepLauncher::default());
        let sup = Arc::new(WorkerSupervisor::new(
            dir.path().join("rackd.yaml"),
            &worker_config(),
            launcher.clone(),
        ));

        let starts: Vec<_> = (0..8)
            .map(|_| {
                let sup = sup.clone();
                tokio::spawn(async move { sup.start(WorkerId(1)).await.unwrap() })
            })
            .collect();
        let outcomes: Vec<_> = join_all(starts)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(outcomes.iter().filter(|o| o.changed()).count(), 1);

        wait_for(&sup, WorkerId(1), |s| *s == WorkerStatus::Running).await;
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);

        let (a, b) = tokio::join!(sup.stop(WorkerId(1)), sup.stop(WorkerId(1)));
        assert_eq!(combine(a, b), Outcome::Changed);
        assert_eq!(a.changed() as u8 + b.changed() as u8, 1);
        sup.shutdown().await;
    }

    #[tokio::test]
    async fn test_rejects_worker_zero() {
        let dir = tempdir().unwrap();
        let sup = WorkerSupervisor::new(
            dir.path().join("rackd.yaml"),
            &worker_config(),
            Arc::new(SleepLauncher::default()),
        );
        assert!(matches!(
            sup.start(WorkerId(0)).await,
            Err(SupervisorError::InvalidWorker)
        ));
    }

    #[tokio::test]
    async fn test_spawn_failure_gives_up_after_budget() {
        struct Missing;

        #[async_trait::async_trait]
        impl WorkerLauncher for Missing {
            fn spawn(&self, id: WorkerId) -> Result<Child, SupervisorError> {
                Command::new("/nonexistent/regiond")
                    .spawn()
                    .map_err(|source| SupervisorError::Spawn { id, source })
            }

            async fn is_ready(&self, _id: WorkerId) -> bool {
                false
            }
        }

        let dir = tempdir().unwrap();
        let sup = WorkerSupervisor::new(dir.path().join("rackd.yaml"), &worker_config(), Arc::new(Missing));
        sup.start(WorkerId(1)).await.unwrap();
        wait_for(&sup, WorkerId(1), |s| matches!(s, WorkerStatus::Failed(_))).await;

        // Two restarts, then the monitor gives up and the state sticks.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(matches!(sup.status(WorkerId(1)), WorkerStatus::Failed(_)));
        assert!(sup.lock().get(&WorkerId(1)).unwrap().task.is_finished());
    }

    #[tokio::test]
    async fn test_stop_cancels_pending_restart() {
        let dir = tempdir().unwrap();
        let mut config = worker_config();
        config.restart.base_ms = 60_000;
        let launcher = Arc::new(SleepLauncher::default());
        let sup = WorkerSupervisor::new(dir.path().join("rackd.yaml"), &config, launcher.clone());

        sup.start(WorkerId(1)).await.unwrap();
        wait_for(&sup, WorkerId(1), |s| *s == WorkerStatus::Running).await;
        let pid = sup.pid(WorkerId(1)).unwrap();
        kill(Pid::from_raw(pid as i32), Signal::SIGKILL).unwrap();
        wait_for(&sup, WorkerId(1), |s| matches!(s, WorkerStatus::Failed(_))).await;

        // Waiting a minute before the restart; stop must not wait for it.
        timeout(Duration::from_secs(2), sup.stop(WorkerId(1)))
            .await
            .unwrap();
        assert_eq!(sup.status(WorkerId(1)), WorkerStatus::Stopped);
        assert_eq!(launcher.spawned.load(Ordering::SeqCst), 1);
    }
}
