use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use common::backoff::BackoffResult;
use common::{ExponentialBackoff, WorkerId};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::process::Child;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::{WorkerLauncher, WorkerStatus};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

enum RunEnd {
    Stopped,
    Failed(String),
}

/// Owns the process of one worker slot for as long as the slot is started.
pub(super) struct Monitor {
    pub(super) id: WorkerId,
    pub(super) launcher: Arc<dyn WorkerLauncher>,
    pub(super) status_tx: watch::Sender<WorkerStatus>,
    pub(super) pid: Arc<AtomicU32>,
    pub(super) stop: CancellationToken,
    pub(super) startup_timeout: Duration,
    pub(super) grace_period: Duration,
    pub(super) backoff: ExponentialBackoff,
}

impl Monitor {
    pub(super) async fn run(mut self) {
        loop {
            let reason = match self.run_once().await {
                RunEnd::Stopped => {
                    self.status_tx.send_replace(WorkerStatus::Stopped);
                    info!(worker = %self.id, "Worker stopped");
                    return;
                }
                RunEnd::Failed(reason) => reason,
            };
            self.status_tx
                .send_replace(WorkerStatus::Failed(reason.clone()));

            match self.backoff.end_attempt_failed() {
                BackoffResult::StartAfter(delay) => {
                    warn!(
                        worker = %self.id,
                        attempt = self.backoff.attempts(),
                        ?delay,
                        "Worker failed: {reason}, restarting"
                    );
                    tokio::select! {
                        _ = self.stop.cancelled() => {
                            self.status_tx.send_replace(WorkerStatus::Stopped);
                            return;
                        }
                        _ = sleep(delay) => {}
                    }
                }
                BackoffResult::Stop => {
                    error!(
                        worker = %self.id,
                        attempts = self.backoff.attempts() - 1,
                        "Worker keeps failing ({reason}), leaving it failed until started again"
                    );
                    return;
                }
            }
        }
    }

    async fn run_once(&mut self) -> RunEnd {
        if self.stop.is_cancelled() {
            return RunEnd::Stopped;
        }
        self.status_tx.send_replace(WorkerStatus::Starting);
        let mut child = match self.launcher.spawn(self.id) {
            Ok(child) => child,
            Err(e) => return RunEnd::Failed(e.to_string()),
        };
        self.pid.store(child.id().unwrap_or(0), Ordering::SeqCst);
        let end = self.supervise(&mut child).await;
        self.pid.store(0, Ordering::SeqCst);
        end
    }

    async fn supervise(&mut self, child: &mut Child) -> RunEnd {
        let deadline = sleep(self.startup_timeout);
        tokio::pin!(deadline);
        let mut poll = interval(READY_POLL_INTERVAL);

        loop {
            tokio::select! {
                _ = self.stop.cancelled() => {
                    terminate(self.id, child, self.grace_period).await;
                    return RunEnd::Stopped;
                }
                res = child.wait() => {
                    return RunEnd::Failed(describe_exit(res, "before becoming ready"));
                }
                _ = &mut deadline => {
                    let _ = child.kill().await;
                    return RunEnd::Failed(format!(
                        "not ready within {:?}",
                        self.startup_timeout
                    ));
                }
                _ = poll.tick() => {
                    if self.launcher.is_ready(self.id).await {
                        break;
                    }
                }
            }
        }

        info!(worker = %self.id, pid = ?child.id(), "Worker is running");
        self.status_tx.send_replace(WorkerStatus::Running);
        self.backoff.start_run();

        tokio::select! {
            _ = self.stop.cancelled() => {
                terminate(self.id, child, self.grace_period).await;
                RunEnd::Stopped
            }
            res = child.wait() => RunEnd::Failed(describe_exit(res, "unexpectedly")),
        }
    }
}

/// SIGTERM, then SIGKILL once the grace period is over.
async fn terminate(id: WorkerId, child: &mut Child, grace_period: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        warn!(worker = %id, pid, "Failed to send SIGTERM: {e}");
    }
    match timeout(grace_period, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            warn!(worker = %id, pid, ?grace_period, "Worker ignored SIGTERM, killing it");
            if let Err(e) = child.kill().await {
                warn!(worker = %id, pid, "Failed to kill worker: {e}");
            }
        }
    }
}

fn describe_exit(res: io::Result<ExitStatus>, when: &str) -> String {
    match res {
        Ok(status) => format!("exited {when} ({status})"),
        Err(e) => format!("could not be waited on: {e}"),
    }
}
