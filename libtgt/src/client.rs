use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, trace};

use crate::TargetError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Offline,
    Ready,
}

impl fmt::Display for DaemonState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonState::Offline => write!(f, "offline"),
            DaemonState::Ready => write!(f, "ready"),
        }
    }
}

/// Administrative surface of the external iSCSI target daemon.
#[async_trait::async_trait]
pub trait TargetDaemon: Send + Sync {
    async fn set_state(&self, state: DaemonState) -> Result<(), TargetError>;
    async fn load_config(&self, path: &Path) -> Result<(), TargetError>;
}

/// Talks to the daemon over its line-oriented control socket.
///
/// Every request opens its own connection, sends one line and waits for a
/// single `ok` or `err <message>` line.
pub struct ControlSocketClient {
    socket: PathBuf,
    request_timeout: Duration,
}

impl ControlSocketClient {
    pub fn new<P: AsRef<Path>>(socket: P, request_timeout: Duration) -> Self {
        ControlSocketClient {
            socket: socket.as_ref().to_path_buf(),
            request_timeout,
        }
    }

    async fn request(&self, line: String) -> Result<(), TargetError> {
        debug!("Sending {line:?} to target daemon");
        match timeout(self.request_timeout, self.exchange(&line)).await {
            Ok(res) => res,
            Err(_) => Err(TargetError::Timeout { request: line }),
        }
    }

    async fn exchange(&self, line: &str) -> Result<(), TargetError> {
        let unreachable = |source| TargetError::Unreachable {
            socket: self.socket.clone(),
            source,
        };
        let mut stream = UnixStream::connect(&self.socket)
            .await
            .map_err(unreachable)?;
        stream
            .write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(unreachable)?;

        let mut reply = String::new();
        let mut reader = BufReader::new(stream);
        reader.read_line(&mut reply).await.map_err(unreachable)?;
        let reply = reply.trim_end();
        trace!("Target daemon replied {reply:?}");

        match reply {
            "ok" => Ok(()),
            r if r.starts_with("err") => Err(TargetError::Rejected {
                request: line.to_string(),
                message: r.trim_start_matches("err").trim().to_string(),
            }),
            other => Err(TargetError::Protocol(other.to_string())),
        }
    }
}

#[async_trait::async_trait]
impl TargetDaemon for ControlSocketClient {
    async fn set_state(&self, state: DaemonState) -> Result<(), TargetError> {
        self.request(format!("set-state {state}")).await
    }

    async fn load_config(&self, path: &Path) -> Result<(), TargetError> {
        self.request(format!("load-config {}", path.display())).await
    }
}
