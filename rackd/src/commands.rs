//! Administrative commands. Every one of them can be re-run safely and
//! reports whether it changed anything.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, anyhow, bail};
use chrono::{DateTime, Utc};
use common::{ClusterConfig, Outcome, SharedSecret, WorkerId};
use libbootres::{BootResourceStore, CommitOutcome, Digest, GenerationId, StoreError};
use tracing::{info, warn};
use uuid::Uuid;

use crate::migrate::{ConfigMigrator, MigrateOutcome};

/// Checksum list expected at the top of an import directory, in
/// `sha256sum` output format.
pub static CHECKSUM_FILE: &str = "SHA256SUMS";

pub fn config_init(config_path: &Path) -> anyhow::Result<Outcome> {
    ClusterConfig::init(config_path)
        .with_context(|| format!("failed to initialise {}", config_path.display()))
}

pub fn config_set_region_url(config_path: &Path, url: &str) -> anyhow::Result<Outcome> {
    let url = url.to_string();
    ClusterConfig::update(config_path, |cfg| cfg.region_url = Some(url))
        .with_context(|| format!("failed to update {}", config_path.display()))
}

pub fn config_set_uuid(config_path: &Path, uuid: &str) -> anyhow::Result<Outcome> {
    let uuid = Uuid::parse_str(uuid).with_context(|| format!("{uuid:?} is not a UUID"))?;
    ClusterConfig::update(config_path, |cfg| cfg.cluster_uuid = Some(uuid))
        .with_context(|| format!("failed to update {}", config_path.display()))
}

pub fn config_show(config_path: &Path) -> anyhow::Result<String> {
    let config = ClusterConfig::load(config_path)?;
    Ok(serde_yaml::to_string(&config)?)
}

/// Install the hex-encoded shared secret where the configuration says.
pub fn install_shared_secret(config_path: &Path, hex: &str) -> anyhow::Result<Outcome> {
    let config = ClusterConfig::load_or_default(config_path)?;
    let secret = SharedSecret::from_hex(hex).context("invalid shared secret")?;
    let outcome = secret
        .install(&config.shared_secret_path)
        .with_context(|| {
            format!(
                "failed to install the shared secret to {}",
                config.shared_secret_path.display()
            )
        })?;
    if outcome.changed() {
        info!(path = %config.shared_secret_path.display(), "Shared secret installed");
    }
    Ok(outcome)
}

/// Create a secret unless a valid one is already installed. Returns the
/// installed secret in hex so it can be handed to the region.
pub fn generate_shared_secret(config_path: &Path) -> anyhow::Result<(Outcome, String)> {
    let config = ClusterConfig::load_or_default(config_path)?;
    if let Ok(Some(existing)) = SharedSecret::load(&config.shared_secret_path) {
        return Ok((Outcome::NoOp, existing.to_hex()));
    }
    let secret = SharedSecret::generate();
    let outcome = secret
        .install(&config.shared_secret_path)
        .with_context(|| {
            format!(
                "failed to install the shared secret to {}",
                config.shared_secret_path.display()
            )
        })?;
    info!(path = %config.shared_secret_path.display(), "Generated a new shared secret");
    Ok((outcome, secret.to_hex()))
}

pub fn upgrade_cluster<P: AsRef<Path>>(
    config_path: &Path,
    legacy: &[P],
) -> anyhow::Result<Vec<(PathBuf, MigrateOutcome)>> {
    Ok(ConfigMigrator::new(config_path).migrate_all(legacy)?)
}

/// Only the persisted worker set changes; a running daemon picks it up on
/// its next worker sync.
pub fn workers_enable(config_path: &Path, id: WorkerId) -> anyhow::Result<Outcome> {
    if id.0 == 0 {
        bail!("worker identities start at 1");
    }
    Ok(ClusterConfig::update(config_path, |cfg| {
        cfg.enabled_workers.insert(id);
    })?)
}

pub fn workers_disable(config_path: &Path, id: WorkerId) -> anyhow::Result<Outcome> {
    Ok(ClusterConfig::update(config_path, |cfg| {
        cfg.enabled_workers.remove(&id);
    })?)
}

pub fn workers_list(config_path: &Path) -> anyhow::Result<BTreeSet<WorkerId>> {
    Ok(ClusterConfig::load_or_default(config_path)?.enabled_workers)
}

/// Import every file listed in `<dir>/SHA256SUMS` as a new generation.
///
/// Files whose content does not match the listed digest are dropped and
/// make the generation fail. Exits early if another writer is active.
pub async fn import_resources(config_path: &Path, dir: &Path) -> anyhow::Result<CommitOutcome> {
    let config = ClusterConfig::load_or_default(config_path)?;
    let sums_path = dir.join(CHECKSUM_FILE);
    let sums = tokio::fs::read_to_string(&sums_path)
        .await
        .with_context(|| format!("failed to read {}", sums_path.display()))?;
    let entries = parse_checksums(&sums)?;
    if entries.is_empty() {
        bail!("{} lists no files", sums_path.display());
    }

    let store = BootResourceStore::open(&config.resource_root)
        .await
        .context("failed to open the boot resource store")?;
    let id = match store.begin_generation().await {
        Ok(id) => id,
        Err(e @ (StoreError::WriterBusy(_) | StoreError::WriterLocked(_))) => {
            bail!("another import is already running: {e}");
        }
        Err(e) => return Err(e.into()),
    };

    for (digest, path) in &entries {
        let source = dir.join(path);
        let bytes = match tokio::fs::read(&source).await {
            Ok(b) => b,
            Err(e) => {
                let _ = store.abandon(id).await;
                return Err(anyhow!(e).context(format!("failed to read {}", source.display())));
            }
        };
        match store.write_file(id, path, &bytes, digest).await {
            Ok(()) => {}
            Err(e @ StoreError::DigestMismatch { .. }) => warn!("{e}"),
            Err(e) => {
                let _ = store.abandon(id).await;
                return Err(e.into());
            }
        }
    }
    Ok(store.commit(id).await?)
}

fn parse_checksums(content: &str) -> anyhow::Result<Vec<(Digest, String)>> {
    content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(|line| {
            let (digest, path) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| anyhow!("malformed checksum line {line:?}"))?;
            // `sha256sum -b` marks binary files with a leading `*`.
            let path = path.trim_start();
            let path = path.strip_prefix('*').unwrap_or(path);
            Ok((Digest::parse(digest)?, path.to_string()))
        })
        .collect()
}

pub struct GenerationSummary {
    pub id: GenerationId,
    pub current: bool,
    pub committed_at: Option<DateTime<Utc>>,
    pub files: usize,
}

impl fmt::Display for GenerationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let marker = if self.current { "*" } else { " " };
        match self.committed_at {
            Some(at) => write!(
                f,
                "{marker} {:>6}  {}  {} files",
                self.id,
                at.format("%Y-%m-%d %H:%M:%S"),
                self.files
            ),
            None => write!(f, "{marker} {:>6}  (manifest unreadable)", self.id),
        }
    }
}

pub async fn generations(config_path: &Path) -> anyhow::Result<Vec<GenerationSummary>> {
    let config = ClusterConfig::load_or_default(config_path)?;
    let store = BootResourceStore::open(&config.resource_root)
        .await
        .context("failed to open the boot resource store")?;
    let current = store.current_generation();

    let mut out = Vec::new();
    for id in store.list_generations().await? {
        let manifest = store.manifest(id).await.ok();
        out.push(GenerationSummary {
            id,
            current: Some(id) == current,
            committed_at: manifest.as_ref().map(|m| m.committed_at),
            files: manifest.as_ref().map_or(0, |m| m.files.len()),
        });
    }
    Ok(out)
}
