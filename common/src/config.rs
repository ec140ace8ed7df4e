use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::ErrorClass;
use crate::{Outcome, WorkerId};

pub static DEFAULT_CONFIG_PATH: &str = "/etc/maas/rackd.yaml";
static DEFAULT_SECRET_PATH: &str = "/var/lib/maas/secret";
static DEFAULT_CONTROL_SOCKET: &str = "/run/tgt/maas.sock";
static DEFAULT_RESOURCE_ROOT: &str = "/var/lib/maas/boot-resources";
static DEFAULT_STATE_DIR: &str = "/var/lib/maas/rackd";
static DEFAULT_WORKER_PROGRAM: &str = "/usr/sbin/regiond";
static DEFAULT_READY_DIR: &str = "/run/maas/workers";

/// Number of region workers enabled by `config --init`.
pub const DEFAULT_WORKER_COUNT: u32 = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file {0:?} does not exist")]
    Missing(PathBuf),

    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse configuration {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        ConfigError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            ConfigError::Io { source, .. } => match ErrorClass::from_io(source) {
                ErrorClass::PermissionDenied => ErrorClass::PermissionDenied,
                _ => ErrorClass::Fatal,
            },
            _ => ErrorClass::Fatal,
        }
    }
}

/// How a worker signals that it finished starting up.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadinessConfig {
    /// The worker creates `<dir>/worker-<id>.ready`.
    Marker { dir: PathBuf },
    /// The worker accepts TCP connections on `base_port + id - 1`.
    Port { host: String, base_port: u16 },
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        ReadinessConfig::Marker {
            dir: PathBuf::from(DEFAULT_READY_DIR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub readiness: ReadinessConfig,
    pub startup_timeout_ms: u64,
    pub grace_period_ms: u64,
    pub restart: BackoffPolicy,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            program: PathBuf::from(DEFAULT_WORKER_PROGRAM),
            args: Vec::new(),
            readiness: ReadinessConfig::default(),
            startup_timeout_ms: 30_000,
            grace_period_ms: 10_000,
            restart: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    pub request_timeout_ms: u64,
    pub retry: BackoffPolicy,
}

impl Default for TargetSettings {
    fn default() -> Self {
        TargetSettings {
            request_timeout_ms: 5_000,
            retry: BackoffPolicy {
                base_ms: 500,
                max_ms: 30_000,
                jitter_ms: 250,
                max_attempts: 0,
                cooldown_ms: 0,
            },
        }
    }
}

/// The persisted rack controller configuration.
///
/// Read at every component startup. Written by the migrator, the
/// administrative CLI commands and by worker enable/disable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub cluster_uuid: Option<Uuid>,
    pub region_url: Option<String>,
    pub shared_secret_path: PathBuf,
    pub enabled_workers: BTreeSet<WorkerId>,
    pub control_socket: PathBuf,
    pub resource_root: PathBuf,
    pub state_dir: PathBuf,
    pub worker: WorkerConfig,
    pub target: TargetSettings,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            cluster_uuid: None,
            region_url: None,
            shared_secret_path: PathBuf::from(DEFAULT_SECRET_PATH),
            enabled_workers: BTreeSet::new(),
            control_socket: PathBuf::from(DEFAULT_CONTROL_SOCKET),
            resource_root: PathBuf::from(DEFAULT_RESOURCE_ROOT),
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            worker: WorkerConfig::default(),
            target: TargetSettings::default(),
        }
    }
}

impl ClusterConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::io(path, e)),
        };
        let cfg: ClusterConfig =
            serde_yaml::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Like [`ClusterConfig::load`], but a missing file yields the defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path) {
            Err(ConfigError::Missing(_)) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(url) = &self.region_url
            && !(url.starts_with("http://") || url.starts_with("https://"))
        {
            return Err(ConfigError::Invalid(format!(
                "region_url must be an http(s) URL, got {url:?}"
            )));
        }
        if self.enabled_workers.contains(&WorkerId(0)) {
            return Err(ConfigError::Invalid(
                "worker identities start at 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Write the configuration atomically: a sibling temp file is written,
    /// synced and renamed over the target.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        self.validate()?;
        let content = serde_yaml::to_string(self).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        write_atomic(path, content.as_bytes(), None)?;
        debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    /// Create a fresh configuration with a new cluster UUID and the default
    /// worker set. Does nothing if the file already exists.
    pub fn init<P: AsRef<Path>>(path: P) -> Result<Outcome, ConfigError> {
        let path = path.as_ref();
        let _guard = UPDATE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        if path.exists() {
            return Ok(Outcome::NoOp);
        }
        let cfg = ClusterConfig {
            cluster_uuid: Some(Uuid::new_v4()),
            enabled_workers: (1..=DEFAULT_WORKER_COUNT).map(WorkerId).collect(),
            ..Default::default()
        };
        cfg.save(path)?;
        Ok(Outcome::Changed)
    }

    /// Load, apply `f`, and save only if `f` changed anything.
    pub fn update<P, F>(path: P, f: F) -> Result<Outcome, ConfigError>
    where
        P: AsRef<Path>,
        F: FnOnce(&mut ClusterConfig),
    {
        let path = path.as_ref();
        let _guard = UPDATE_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let before = Self::load_or_default(path)?;
        let mut after = before.clone();
        f(&mut after);
        if after == before && path.exists() {
            return Ok(Outcome::NoOp);
        }
        after.save(path)?;
        Ok(Outcome::Changed)
    }
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Read-modify-write cycles of `update` within this process.
static UPDATE_LOCK: Mutex<()> = Mutex::new(());

/// Write `bytes` to `path` via a temp file and rename. `mode` sets unix
/// permissions on the temp file before the rename.
pub fn write_atomic(path: &Path, bytes: &[u8], mode: Option<u32>) -> Result<(), ConfigError> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent, e))?;

    let file_name = path
        .file_name()
        .ok_or_else(|| ConfigError::Invalid(format!("{path:?} has no file name")))?;
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(format!(
        ".tmp.{}.{}",
        std::process::id(),
        TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let tmp = parent.join(tmp_name);

    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    set_mode(&mut opts, mode);

    let mut file = opts.open(&tmp).map_err(|e| ConfigError::io(&tmp, e))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| ConfigError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| {
        let _ = fs::remove_file(&tmp);
        ConfigError::io(path, e)
    })
}

#[cfg(unix)]
fn set_mode(opts: &mut fs::OpenOptions, mode: Option<u32>) {
    use std::os::unix::fs::OpenOptionsExt;
    if let Some(mode) = mode {
        opts.mode(mode);
    }
}

#[cfg(not(unix))]
fn set_mode(_opts: &mut fs::OpenOptions, _mode: Option<u32>) {}

#[cfg(test)]
mod test {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_concurrent_updates_keep_every_change() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rackd.yaml");
        ClusterConfig::init(&path).unwrap();

        std::thread::scope(|s| {
            for id in 10..26 {
                let path = &path;
                s.spawn(move || {
                    ClusterConfig::update(path, |cfg| {
                        cfg.enabled_workers.insert(WorkerId(id));
                    })
                    .unwrap();
                });
            }
        });

        let enabled = ClusterConfig::load(&path).unwrap().enabled_workers;
        assert!((10..26).all(|id| enabled.contains(&WorkerId(id))));
        let leftovers = fs::read_dir(dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .contains(".tmp.")
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_init_is_idempotent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rackd.yaml");
        assert_eq!(ClusterConfig::init(&path).unwrap(), Outcome::Changed);
        let first = ClusterConfig::load(&path).unwrap();
        assert!(first.cluster_uuid.is_some());
        assert_eq!(first.enabled_workers.len(), DEFAULT_WORKER_COUNT as usize);

        assert_eq!(ClusterConfig::init(&path).unwrap(), Outcome::NoOp);
        let second = ClusterConfig::load(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_update_reports_noop() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rackd.yaml");
        let url = "http://region.example:5240/MAAS".to_string();
        let set = |c: &mut ClusterConfig| c.region_url = Some(url.clone());
        assert_eq!(ClusterConfig::update(&path, set).unwrap(), Outcome::Changed);
        let set = |c: &mut ClusterConfig| c.region_url = Some(url.clone());
        assert_eq!(ClusterConfig::update(&path, set).unwrap(), Outcome::NoOp);
        assert_eq!(
            ClusterConfig::load(&path).unwrap().region_url.as_deref(),
            Some(url.as_str())
        );
    }

    #[test]
    fn test_missing_and_invalid() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nope.yaml");
        assert!(matches!(
            ClusterConfig::load(&path),
            Err(ConfigError::Missing(_))
        ));
        assert_eq!(
            ClusterConfig::load_or_default(&path).unwrap(),
            ClusterConfig::default()
        );

        fs::write(&path, "region_url: ftp://nowhere\n").unwrap();
        assert!(matches!(
            ClusterConfig::load(&path),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("rackd.yaml");
        fs::write(
            &path,
            "region_url: http://10.0.0.1:5240/MAAS\nenabled_workers: [1, 3]\nworker:\n  readiness:\n    kind: port\n    host: 127.0.0.1\n    base_port: 5250\n",
        )
        .unwrap();
        let cfg = ClusterConfig::load(&path).unwrap();
        assert_eq!(
            cfg.enabled_workers.iter().copied().collect::<Vec<_>>(),
            vec![WorkerId(1), WorkerId(3)]
        );
        assert_eq!(cfg.worker.grace_period_ms, 10_000);
        assert_eq!(
            cfg.worker.readiness,
            ReadinessConfig::Port {
                host: "127.0.0.1".to_string(),
                base_port: 5250
            }
        );
        assert_eq!(cfg.control_socket, PathBuf::from(DEFAULT_CONTROL_SOCKET));
    }
}
