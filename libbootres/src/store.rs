use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, watch};
use tracing::{debug, info, warn};

use crate::manifest::{Digest, Manifest, ManifestEntry, validate_resource_path};
use crate::paths::PathManager;
use crate::{GenerationId, StoreError};

/// Snapshot of the `current` pointer.
///
/// `version` increases on every swap, so readers can tell two observations
/// of the same generation id apart from an unchanged pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CurrentPointer {
    pub version: u64,
    pub generation: Option<GenerationId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every file matched its digest and the generation is now current.
    Verified(GenerationId),
    /// The generation was discarded. The previous current generation is
    /// unchanged.
    Failed(String),
}

impl CommitOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, CommitOutcome::Verified(_))
    }
}

/// The generation currently held by the single writer.
struct Pending {
    id: GenerationId,
    files: BTreeMap<String, Digest>,
    /// First verification failure seen while writing; the commit will fail.
    poisoned: Option<String>,
    _lock: WriterLock,
}

/// Exclusive lock file shared with other processes writing into the same
/// store. Removed when dropped.
struct WriterLock {
    path: PathBuf,
}

impl WriterLock {
    /// The pid is written to a private file first and then hard-linked into
    /// place, so the lock never exists without its owner.
    async fn acquire(path: PathBuf) -> Result<Self, StoreError> {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        let pid = std::process::id();
        let mut tmp = path.clone().into_os_string();
        tmp.push(format!(".{pid}.{}", SEQ.fetch_add(1, Ordering::Relaxed)));
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, pid.to_string())
            .await
            .map_err(|e| StoreError::io(&tmp, e))?;
        let linked = fs::hard_link(&tmp, &path).await;
        let _ = fs::remove_file(&tmp).await;
        match linked {
            Ok(()) => Ok(WriterLock { path }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(StoreError::WriterLocked(path))
            }
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }
}

impl Drop for WriterLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != io::ErrorKind::NotFound
        {
            warn!("Failed to remove writer lock {:?}: {e}", self.path);
        }
    }
}

/// Store of boot resource generations.
///
/// Single writer, many readers: `begin_generation`, `write_file` and
/// `commit` are serialised through one mutex, while `current_generation`
/// only reads the published pointer and never waits for a writer.
pub struct BootResourceStore {
    paths: PathManager,
    writer: Mutex<Option<Pending>>,
    current_tx: watch::Sender<CurrentPointer>,
    held: StdMutex<BTreeMap<GenerationId, usize>>,
    next_id: AtomicU64,
}

impl BootResourceStore {
    /// Open the store rooted at `root`, creating the layout if needed.
    ///
    /// Staging directories left by abandoned or interrupted writers are
    /// removed, unless the writer lock belongs to a live process.
    pub async fn open<P: AsRef<Path>>(root: P) -> Result<Self, StoreError> {
        let paths = PathManager::new(root);
        for dir in [paths.staging_path(), paths.generations_path()] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| StoreError::io(&dir, e))?;
        }

        let committed = list_ids(&paths.generations_path()).await?;
        let staged = list_ids(&paths.staging_path()).await?;
        let max_seen = committed.iter().chain(staged.iter()).max().copied();

        if !writer_is_live(&paths.writer_lock_path()).await {
            clean_staging(&paths, &staged).await?;
        } else {
            debug!("Writer lock is held by a live process, leaving staging untouched");
        }
        clean_link_leftovers(&paths).await?;

        let current = read_current_link(&paths).await?;
        let current = match current {
            Some(id) if committed.contains(&id) => Some(id),
            Some(id) => {
                warn!("current points at missing generation {id}, treating store as empty");
                None
            }
            None => None,
        };
        info!(
            root = %paths.root().display(),
            generations = committed.len(),
            current = ?current,
            "Boot resource store opened"
        );

        let (current_tx, _) = watch::channel(CurrentPointer {
            version: 0,
            generation: current,
        });
        Ok(BootResourceStore {
            paths,
            writer: Mutex::new(None),
            current_tx,
            held: StdMutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(max_seen.map_or(1, |id| id.0 + 1)),
        })
    }

    pub fn root(&self) -> &Path {
        self.paths.root()
    }

    /// Start a new in-progress generation. Fails if another one is still
    /// being written, by this process or by another one.
    pub async fn begin_generation(&self) -> Result<GenerationId, StoreError> {
        let mut writer = self.writer.lock().await;
        if let Some(pending) = writer.as_ref() {
            return Err(StoreError::WriterBusy(pending.id));
        }
        let lock = WriterLock::acquire(self.paths.writer_lock_path()).await?;

        // Another process may have committed since this store was opened.
        let committed = list_ids(&self.paths.generations_path()).await?;
        let staged = list_ids(&self.paths.staging_path()).await?;
        if let Some(max) = committed.iter().chain(staged.iter()).max() {
            self.next_id.fetch_max(max.next().0, Ordering::SeqCst);
        }
        let id = GenerationId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let dir = self.paths.staging_generation_path(id);
        fs::create_dir_all(&dir)
            .await
            .map_err(|e| StoreError::io(&dir, e))?;

        *writer = Some(Pending {
            id,
            files: BTreeMap::new(),
            poisoned: None,
            _lock: lock,
        });
        debug!(generation = %id, "Began boot resource generation");
        Ok(id)
    }

    /// Write one file of the in-progress generation.
    ///
    /// `expected` is the digest published by the sync source. A mismatch
    /// removes the file, fails this call and dooms the generation: its
    /// commit will report failure.
    pub async fn write_file(
        &self,
        id: GenerationId,
        path: &str,
        bytes: &[u8],
        expected: &Digest,
    ) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        let pending = match writer.as_mut() {
            Some(p) if p.id == id => p,
            _ => return Err(StoreError::UnknownGeneration(id)),
        };
        validate_resource_path(path)?;

        let file_path = self.paths.staging_generation_path(id).join(path);
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::io(parent, e))?;
        }
        let mut file = File::create(&file_path)
            .await
            .map_err(|e| StoreError::io(&file_path, e))?;
        file.write_all(bytes)
            .await
            .map_err(|e| StoreError::io(&file_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(&file_path, e))?;
        pending.files.insert(path.to_string(), expected.clone());

        let actual = Digest::of(bytes);
        if actual != *expected {
            let _ = fs::remove_file(&file_path).await;
            let err = StoreError::DigestMismatch {
                path: path.to_string(),
                expected: expected.to_string(),
                actual: actual.to_string(),
            };
            warn!(generation = %id, "Deleted {path}: {err}");
            pending.poisoned.get_or_insert_with(|| err.to_string());
            return Err(err);
        }
        Ok(())
    }

    /// Verify every file of the generation and, on full success, make it
    /// current. On any failure the generation's files are removed and the
    /// current generation is left as it was.
    pub async fn commit(&self, id: GenerationId) -> Result<CommitOutcome, StoreError> {
        let mut writer = self.writer.lock().await;
        let pending = match writer.take() {
            Some(p) if p.id == id => p,
            other => {
                *writer = other;
                return Err(StoreError::UnknownGeneration(id));
            }
        };

        let staging = self.paths.staging_generation_path(id);
        let entries = match self.verify(&pending, &staging).await {
            Ok(entries) => entries,
            Err(reason) => {
                warn!(generation = %id, "Discarding corrupt generation: {reason}");
                remove_dir_if_exists(&staging).await?;
                return Ok(CommitOutcome::Failed(reason));
            }
        };

        let manifest = Manifest {
            generation: id,
            committed_at: Utc::now(),
            files: entries,
        };
        if let Err(e) = self.promote(&manifest, &staging).await {
            let _ = remove_dir_if_exists(&staging).await;
            return Err(e);
        }
        drop(pending);

        self.current_tx.send_modify(|ptr| {
            ptr.version += 1;
            ptr.generation = Some(id);
        });
        info!(
            generation = %id,
            files = manifest.files.len(),
            "Boot resource generation is now current"
        );
        Ok(CommitOutcome::Verified(id))
    }

    /// Drop the in-progress generation without committing it.
    pub async fn abandon(&self, id: GenerationId) -> Result<(), StoreError> {
        let mut writer = self.writer.lock().await;
        match writer.take() {
            Some(p) if p.id == id => {
                remove_dir_if_exists(&self.paths.staging_generation_path(id)).await?;
                debug!(generation = %id, "Abandoned boot resource generation");
                Ok(())
            }
            other => {
                *writer = other;
                Err(StoreError::UnknownGeneration(id))
            }
        }
    }

    pub fn current_generation(&self) -> Option<GenerationId> {
        self.current_tx.borrow().generation
    }

    pub fn current(&self) -> CurrentPointer {
        *self.current_tx.borrow()
    }

    /// Receive every change of the current pointer.
    pub fn subscribe(&self) -> watch::Receiver<CurrentPointer> {
        self.current_tx.subscribe()
    }

    /// Committed generations in ascending order.
    pub async fn list_generations(&self) -> Result<Vec<GenerationId>, StoreError> {
        let ids = list_ids(&self.paths.generations_path()).await?;
        Ok(ids.into_iter().collect())
    }

    pub fn generation_path(&self, id: GenerationId) -> PathBuf {
        self.paths.generation_path(id)
    }

    pub async fn manifest(&self, id: GenerationId) -> Result<Manifest, StoreError> {
        let path = self.paths.manifest_path(id);
        let content = match fs::read(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::GenerationNotFound(id));
            }
            Err(e) => return Err(StoreError::io(&path, e)),
        };
        serde_json::from_slice(&content).map_err(|source| StoreError::Manifest { path, source })
    }

    /// Re-read the on-disk pointer, which another process may have swapped,
    /// and publish it if it moved.
    pub async fn refresh(&self) -> Result<Option<GenerationId>, StoreError> {
        let on_disk = read_current_link(&self.paths).await?;
        let on_disk = match on_disk {
            Some(id) if fs::metadata(self.paths.generation_path(id)).await.is_ok() => Some(id),
            _ => None,
        };
        if let Some(id) = on_disk {
            let next = id.next().0;
            self.next_id.fetch_max(next, Ordering::SeqCst);
        }
        let changed = self.current_tx.send_if_modified(|ptr| {
            if ptr.generation == on_disk || on_disk.is_none() {
                return false;
            }
            ptr.version += 1;
            ptr.generation = on_disk;
            true
        });
        if changed {
            info!(generation = ?on_disk, "Picked up current generation swapped on disk");
        }
        Ok(self.current_generation())
    }

    /// Mark a generation as being served. Held generations are never
    /// garbage collected.
    pub fn hold(&self, id: GenerationId) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        *held.entry(id).or_insert(0) += 1;
    }

    pub fn release(&self, id: GenerationId) {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = held.get_mut(&id) {
            *count -= 1;
            if *count == 0 {
                held.remove(&id);
            }
        }
    }

    pub fn held(&self) -> BTreeSet<GenerationId> {
        let held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        held.keys().copied().collect()
    }

    /// Remove every committed generation that is neither current nor held.
    ///
    /// Another process may be committing into the same root, so nothing is
    /// removed while the writer lock is live, and no generation at or above
    /// the on-disk `current` is ever removed.
    pub async fn collect_garbage(&self) -> Result<Vec<GenerationId>, StoreError> {
        // Serialise with commit so the pointer cannot move under us.
        let writer = self.writer.lock().await;
        let committed = list_ids(&self.paths.generations_path()).await?;
        if writer.is_some() || writer_is_live(&self.paths.writer_lock_path()).await {
            debug!("A generation is being written, skipping garbage collection");
            return Ok(Vec::new());
        }
        self.refresh().await?;

        let on_disk = read_current_link(&self.paths).await?;
        let current = self.current_generation();
        let held = self.held();

        let mut removed = Vec::new();
        for id in committed {
            if Some(id) == current || held.contains(&id) || on_disk.is_some_and(|c| id >= c) {
                continue;
            }
            remove_dir_if_exists(&self.paths.generation_path(id)).await?;
            info!(generation = %id, "Removed superseded boot resource generation");
            removed.push(id);
        }
        drop(writer);
        Ok(removed)
    }

    async fn verify(&self, pending: &Pending, staging: &Path) -> Result<Vec<ManifestEntry>, String> {
        if let Some(reason) = &pending.poisoned {
            return Err(reason.clone());
        }
        if pending.files.is_empty() {
            return Err(format!("generation {} has no files", pending.id));
        }
        let mut entries = Vec::with_capacity(pending.files.len());
        for (path, expected) in &pending.files {
            let file_path = staging.join(path);
            let actual = Digest::of_file(&file_path)
                .await
                .map_err(|e| format!("{path}: {e}"))?;
            if actual != *expected {
                return Err(format!(
                    "digest mismatch for {path}: expected {expected}, got {actual}"
                ));
            }
            let size = fs::metadata(&file_path)
                .await
                .map_err(|e| format!("{path}: {e}"))?
                .len();
            entries.push(ManifestEntry {
                path: path.clone(),
                size,
                sha256: actual,
            });
        }
        Ok(entries)
    }

    /// Write the manifest, move the generation out of staging and swap the
    /// `current` link.
    async fn promote(&self, manifest: &Manifest, staging: &Path) -> Result<(), StoreError> {
        let id = manifest.generation;
        let manifest_path = staging.join(crate::paths::MANIFEST_FILE);
        let content = serde_json::to_vec_pretty(manifest).map_err(|source| {
            StoreError::Manifest {
                path: manifest_path.clone(),
                source,
            }
        })?;
        let mut file = File::create(&manifest_path)
            .await
            .map_err(|e| StoreError::io(&manifest_path, e))?;
        file.write_all(&content)
            .await
            .map_err(|e| StoreError::io(&manifest_path, e))?;
        file.sync_all()
            .await
            .map_err(|e| StoreError::io(&manifest_path, e))?;

        let committed = self.paths.generation_path(id);
        fs::rename(staging, &committed)
            .await
            .map_err(|e| StoreError::io(&committed, e))?;

        let tmp_link = self.paths.current_link_tmp_path(id);
        let _ = fs::remove_file(&tmp_link).await;
        fs::symlink(self.paths.current_link_target(id), &tmp_link)
            .await
            .map_err(|e| StoreError::io(&tmp_link, e))?;
        let link = self.paths.current_link_path();
        fs::rename(&tmp_link, &link)
            .await
            .map_err(|e| StoreError::io(&link, e))?;
        Ok(())
    }
}

async fn list_ids(dir: &Path) -> Result<BTreeSet<GenerationId>, StoreError> {
    let mut ids = BTreeSet::new();
    let mut entries = match fs::read_dir(dir).await {
        Ok(e) => e,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(ids),
        Err(e) => return Err(StoreError::io(dir, e)),
    };
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(dir, e))?
    {
        let name = entry.file_name();
        match name.to_str().and_then(|n| n.parse::<GenerationId>().ok()) {
            Some(id) => {
                ids.insert(id);
            }
            None => debug!("Ignoring unexpected entry {name:?} in {dir:?}"),
        }
    }
    Ok(ids)
}

async fn read_current_link(paths: &PathManager) -> Result<Option<GenerationId>, StoreError> {
    let link = paths.current_link_path();
    match fs::read_link(&link).await {
        Ok(target) => Ok(paths.generation_from_link(&target)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(&link, e)),
    }
}

/// Whether the writer lock exists and names a process that is still alive.
/// A lock left by a dead process is removed.
async fn writer_is_live(lock: &Path) -> bool {
    let content = match fs::read_to_string(lock).await {
        Ok(c) => c,
        Err(_) => return false,
    };
    let alive = content
        .trim()
        .parse::<i32>()
        .map(|pid| kill(Pid::from_raw(pid), None).is_ok())
        .unwrap_or(false);
    if !alive {
        warn!("Removing stale writer lock {lock:?}");
        let _ = fs::remove_file(lock).await;
    }
    alive
}

async fn clean_staging(paths: &PathManager, staged: &BTreeSet<GenerationId>) -> Result<(), StoreError> {
    for id in staged {
        warn!(generation = %id, "Removing partially written generation");
        remove_dir_if_exists(&paths.staging_generation_path(*id)).await?;
    }
    Ok(())
}

async fn clean_link_leftovers(paths: &PathManager) -> Result<(), StoreError> {
    let root = paths.root();
    let mut entries = fs::read_dir(root)
        .await
        .map_err(|e| StoreError::io(root, e))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| StoreError::io(root, e))?
    {
        if let Some(name) = entry.file_name().to_str()
            && paths.is_current_tmp(name)
        {
            let _ = fs::remove_file(entry.path()).await;
        }
    }
    Ok(())
}

async fn remove_dir_if_exists(dir: &Path) -> Result<(), StoreError> {
    match fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io(dir, e)),
    }
}
