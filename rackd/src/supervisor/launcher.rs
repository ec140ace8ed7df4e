use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use common::WorkerId;
use common::config::{ReadinessConfig, WorkerConfig};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio::time::timeout;
use tracing::debug;

use super::SupervisorError;

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(500);

/// Starts worker processes and tells when they are ready to serve.
#[async_trait::async_trait]
pub trait WorkerLauncher: Send + Sync {
    fn spawn(&self, id: WorkerId) -> Result<Child, SupervisorError>;

    /// One readiness probe. Polled until it succeeds or the startup
    /// window elapses.
    async fn is_ready(&self, id: WorkerId) -> bool;
}

/// Runs `<program> [args..] <id>`.
///
/// The worker sees `RACKD_WORKER_ID`, and either `RACKD_READY_FILE` (the
/// marker it must create once started) or `RACKD_WORKER_PORT` (the port it
/// must listen on). `RACKD_SHARED_SECRET_FILE` names the secret it uses to
/// authenticate with the region.
pub struct CommandLauncher {
    program: PathBuf,
    args: Vec<String>,
    readiness: ReadinessConfig,
    shared_secret: Option<PathBuf>,
}

impl CommandLauncher {
    pub fn new(config: &WorkerConfig) -> Self {
        CommandLauncher {
            program: config.program.clone(),
            args: config.args.clone(),
            readiness: config.readiness.clone(),
            shared_secret: None,
        }
    }

    pub fn with_shared_secret(mut self, path: PathBuf) -> Self {
        self.shared_secret = Some(path);
        self
    }

    pub fn ready_file(&self, id: WorkerId) -> Option<PathBuf> {
        match &self.readiness {
            ReadinessConfig::Marker { dir } => Some(dir.join(format!("worker-{id}.ready"))),
            ReadinessConfig::Port { .. } => None,
        }
    }

    fn port(&self, id: WorkerId) -> Option<(String, u16)> {
        match &self.readiness {
            ReadinessConfig::Port { host, base_port } => {
                let offset = u16::try_from(id.0.saturating_sub(1)).ok()?;
                Some((host.clone(), base_port.checked_add(offset)?))
            }
            ReadinessConfig::Marker { .. } => None,
        }
    }
}

#[async_trait::async_trait]
impl WorkerLauncher for CommandLauncher {
    fn spawn(&self, id: WorkerId) -> Result<Child, SupervisorError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(id.to_string())
            .env("RACKD_WORKER_ID", id.to_string())
            .stdin(Stdio::null())
            .kill_on_drop(true);

        if let Some(ready_file) = self.ready_file(id) {
            // A marker left by the previous process must not count.
            if let Err(e) = std::fs::remove_file(&ready_file)
                && e.kind() != std::io::ErrorKind::NotFound
            {
                return Err(SupervisorError::Spawn { id, source: e });
            }
            if let Some(dir) = ready_file.parent() {
                std::fs::create_dir_all(dir).map_err(|source| SupervisorError::Spawn { id, source })?;
            }
            cmd.env("RACKD_READY_FILE", &ready_file);
        }
        if let Some((_, port)) = self.port(id) {
            cmd.env("RACKD_WORKER_PORT", port.to_string());
        }
        if let Some(secret) = &self.shared_secret {
            cmd.env("RACKD_SHARED_SECRET_FILE", secret);
        }

        debug!(worker = %id, program = %self.program.display(), "Spawning worker");
        cmd.spawn()
            .map_err(|source| SupervisorError::Spawn { id, source })
    }

    async fn is_ready(&self, id: WorkerId) -> bool {
        if let Some(ready_file) = self.ready_file(id) {
            return tokio::fs::try_exists(&ready_file).await.unwrap_or(false);
        }
        match self.port(id) {
            Some((host, port)) => matches!(
                timeout(PORT_PROBE_TIMEOUT, TcpStream::connect((host.as_str(), port))).await,
                Ok(Ok(_))
            ),
            None => false,
        }
    }
}
