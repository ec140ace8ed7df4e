//! One-shot migration of legacy cluster configuration files.
//!
//! Three on-disk shapes are recognised:
//!
//! - shell-env `maas_cluster.conf`: `MAAS_URL="..."`, `CLUSTER_UUID="..."`,
//!   `CLUSTER_CONTROL_SOCKET="..."`;
//! - legacy YAML (`pserv.yaml`, old `rackd.conf`): `maas_url`,
//!   `cluster_uuid` and `tgt: { control_socket }`;
//! - the current schema, which has `region_url`.
//!
//! A migrated file is renamed to `<name>.migrated`, so running the migration
//! again finds nothing to do.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use common::{ClusterConfig, ConfigError, ErrorClass};
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Legacy files looked at by `upgrade-cluster` and at daemon startup.
pub static LEGACY_PATHS: &[&str] = &[
    "/etc/maas/maas_cluster.conf",
    "/etc/maas/pserv.yaml",
    "/etc/maas/rackd.conf",
];

static MIGRATED_SUFFIX: &str = "migrated";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateOutcome {
    Migrated,
    AlreadyCurrent,
    UnrecognizedFormat,
}

impl std::fmt::Display for MigrateOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrateOutcome::Migrated => write!(f, "migrated"),
            MigrateOutcome::AlreadyCurrent => write!(f, "already current"),
            MigrateOutcome::UnrecognizedFormat => write!(f, "unrecognized format, skipped"),
        }
    }
}

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to access {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid {key} {value:?} in {path:?}")]
    InvalidValue {
        path: PathBuf,
        key: &'static str,
        value: String,
    },
}

impl MigrateError {
    pub fn class(&self) -> ErrorClass {
        match self {
            MigrateError::Config(e) => e.class(),
            MigrateError::Io { source, .. } => match ErrorClass::from_io(source) {
                ErrorClass::PermissionDenied => ErrorClass::PermissionDenied,
                _ => ErrorClass::Fatal,
            },
            MigrateError::InvalidValue { .. } => ErrorClass::ConfigFormatUnrecognized,
        }
    }
}

/// Values carried over from a legacy file.
#[derive(Debug, Default, PartialEq, Eq)]
struct LegacyValues {
    region_url: Option<String>,
    cluster_uuid: Option<String>,
    control_socket: Option<String>,
}

enum Detected {
    Current,
    Legacy(LegacyValues),
    Unrecognized,
}

/// Merges legacy configuration into the current configuration file.
pub struct ConfigMigrator {
    config_path: PathBuf,
}

impl ConfigMigrator {
    pub fn new<P: AsRef<Path>>(config_path: P) -> Self {
        ConfigMigrator {
            config_path: config_path.as_ref().to_path_buf(),
        }
    }

    pub fn migrate<P: AsRef<Path>>(&self, old_path: P) -> Result<MigrateOutcome, MigrateError> {
        let old_path = old_path.as_ref();
        let content = match fs::read_to_string(old_path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!(path = %old_path.display(), "No legacy configuration to migrate");
                return Ok(MigrateOutcome::AlreadyCurrent);
            }
            // Binary content is as unrecognised as malformed text.
            Err(e) if e.kind() == io::ErrorKind::InvalidData => {
                warn!(path = %old_path.display(), "Skipping legacy configuration: not text");
                return Ok(MigrateOutcome::UnrecognizedFormat);
            }
            Err(e) => {
                return Err(MigrateError::Io {
                    path: old_path.to_path_buf(),
                    source: e,
                });
            }
        };

        let legacy = match detect(&content) {
            Detected::Current => return Ok(MigrateOutcome::AlreadyCurrent),
            Detected::Unrecognized => {
                warn!(
                    path = %old_path.display(),
                    "Skipping configuration in an unrecognized format"
                );
                return Ok(MigrateOutcome::UnrecognizedFormat);
            }
            Detected::Legacy(values) => values,
        };

        let uuid = match &legacy.cluster_uuid {
            Some(raw) => Some(Uuid::parse_str(raw).map_err(|_| MigrateError::InvalidValue {
                path: old_path.to_path_buf(),
                key: "cluster UUID",
                value: raw.clone(),
            })?),
            None => None,
        };
        ClusterConfig::update(&self.config_path, |cfg| {
            if let Some(url) = &legacy.region_url {
                cfg.region_url = Some(url.clone());
            }
            if let Some(uuid) = uuid {
                cfg.cluster_uuid = Some(uuid);
            }
            if let Some(socket) = &legacy.control_socket {
                cfg.control_socket = PathBuf::from(socket);
            }
        })?;

        let renamed = migrated_path(old_path);
        fs::rename(old_path, &renamed).map_err(|source| MigrateError::Io {
            path: old_path.to_path_buf(),
            source,
        })?;
        info!(
            from = %old_path.display(),
            into = %self.config_path.display(),
            "Migrated legacy cluster configuration"
        );
        Ok(MigrateOutcome::Migrated)
    }

    /// Migrate every file in `paths`, in order. Later files win where they
    /// carry the same value.
    pub fn migrate_all<P: AsRef<Path>>(
        &self,
        paths: &[P],
    ) -> Result<Vec<(PathBuf, MigrateOutcome)>, MigrateError> {
        paths
            .iter()
            .map(|p| {
                let p = p.as_ref();
                Ok((p.to_path_buf(), self.migrate(p)?))
            })
            .collect()
    }
}

fn migrated_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(MIGRATED_SUFFIX);
    PathBuf::from(name)
}

fn detect(content: &str) -> Detected {
    match serde_yaml::from_str::<Value>(content) {
        Ok(Value::Mapping(map)) => detect_yaml(&map),
        // `KEY="value"` lines parse as a YAML scalar, if at all.
        _ => detect_shell(content),
    }
}

fn detect_yaml(map: &Mapping) -> Detected {
    if map.contains_key("region_url") {
        return Detected::Current;
    }
    let Some(url) = map.get("maas_url").and_then(Value::as_str) else {
        return Detected::Unrecognized;
    };
    let control_socket = map
        .get("tgt")
        .and_then(|tgt| tgt.get("control_socket"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Detected::Legacy(LegacyValues {
        region_url: Some(url.to_string()),
        cluster_uuid: map
            .get("cluster_uuid")
            .and_then(Value::as_str)
            .map(str::to_string),
        control_socket,
    })
}

fn detect_shell(content: &str) -> Detected {
    let mut vars = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line = line.strip_prefix("export ").unwrap_or(line);
        let Some((key, value)) = line.split_once('=') else {
            return Detected::Unrecognized;
        };
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);
        vars.insert(key.trim().to_string(), value.to_string());
    }

    let Some(url) = vars.remove("MAAS_URL") else {
        return Detected::Unrecognized;
    };
    let non_empty = |v: Option<String>| v.filter(|s| !s.is_empty());
    Detected::Legacy(LegacyValues {
        region_url: Some(url),
        cluster_uuid: non_empty(vars.remove("CLUSTER_UUID")),
        control_socket: non_empty(vars.remove("CLUSTER_CONTROL_SOCKET")),
    })
}
