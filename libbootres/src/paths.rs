// PathManager maps generations to their location under the store root.
//
// The layout is roughly as follows:
//
//	<root>
//	├── staging
//	│   └── <generation>          in progress, never served
//	│       └── <resource files>
//	├── generations
//	│   └── <generation>          committed and verified, immutable
//	│       ├── manifest.json
//	│       └── <resource files>
//	├── current -> generations/<generation>
//	└── writer.lock
//
// A generation only ever moves from staging to generations by a single
// rename, after every file has been verified. `current` is replaced by
// renaming a freshly created symlink over it.

use std::path::{Path, PathBuf};

use crate::GenerationId;

pub static MANIFEST_FILE: &str = "manifest.json";
static CURRENT_LINK: &str = "current";
static STAGING_DIR: &str = "staging";
static GENERATIONS_DIR: &str = "generations";
static WRITER_LOCK: &str = "writer.lock";

#[derive(Clone, Debug)]
pub struct PathManager {
    root_path: PathBuf,
}

impl PathManager {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        PathManager {
            root_path: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_path
    }

    /// (e.g. `<root>/staging`).
    pub fn staging_path(&self) -> PathBuf {
        self.root_path.join(STAGING_DIR)
    }

    /// (e.g. `<root>/staging/<generation>`).
    pub fn staging_generation_path(&self, id: GenerationId) -> PathBuf {
        self.staging_path().join(id.dir_name())
    }

    /// (e.g. `<root>/generations`).
    pub fn generations_path(&self) -> PathBuf {
        self.root_path.join(GENERATIONS_DIR)
    }

    /// (e.g. `<root>/generations/<generation>`).
    pub fn generation_path(&self, id: GenerationId) -> PathBuf {
        self.generations_path().join(id.dir_name())
    }

    /// (e.g. `<root>/generations/<generation>/manifest.json`).
    pub fn manifest_path(&self, id: GenerationId) -> PathBuf {
        self.generation_path(id).join(MANIFEST_FILE)
    }

    /// (e.g. `<root>/current`).
    pub fn current_link_path(&self) -> PathBuf {
        self.root_path.join(CURRENT_LINK)
    }

    /// Target written into the `current` symlink. Relative, so the store can
    /// be moved as a whole.
    pub fn current_link_target(&self, id: GenerationId) -> PathBuf {
        Path::new(GENERATIONS_DIR).join(id.dir_name())
    }

    /// Temporary symlink that is renamed over `current`.
    pub fn current_link_tmp_path(&self, id: GenerationId) -> PathBuf {
        self.root_path
            .join(format!("{CURRENT_LINK}.tmp.{}", id.dir_name()))
    }

    /// (e.g. `<root>/writer.lock`).
    pub fn writer_lock_path(&self) -> PathBuf {
        self.root_path.join(WRITER_LOCK)
    }

    /// Recover the generation a `current` link target points at.
    pub fn generation_from_link(&self, target: &Path) -> Option<GenerationId> {
        let name = target.file_name()?.to_str()?;
        name.parse().ok()
    }

    pub fn is_current_tmp(&self, name: &str) -> bool {
        name.starts_with(&format!("{CURRENT_LINK}.tmp."))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_layout() {
        let pm = PathManager::new("/srv/boot");
        let id = GenerationId(7);
        assert_eq!(
            pm.generation_path(id),
            PathBuf::from("/srv/boot/generations/00000000000000000007")
        );
        assert_eq!(
            pm.staging_generation_path(id),
            PathBuf::from("/srv/boot/staging/00000000000000000007")
        );
        assert_eq!(
            pm.manifest_path(id),
            PathBuf::from("/srv/boot/generations/00000000000000000007/manifest.json")
        );
        assert_eq!(
            pm.current_link_target(id),
            PathBuf::from("generations/00000000000000000007")
        );
        assert_eq!(
            pm.generation_from_link(&pm.current_link_target(id)),
            Some(id)
        );
        assert!(pm.is_current_tmp("current.tmp.00000000000000000007"));
        assert!(!pm.is_current_tmp("current"));
    }
}
