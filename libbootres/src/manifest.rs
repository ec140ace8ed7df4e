use std::fmt;
use std::path::{Component, Path};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::{GenerationId, StoreError};

/// Lower-case hex SHA-256 of a resource file.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    pub fn of(bytes: &[u8]) -> Self {
        Digest(hex::encode(Sha256::digest(bytes)))
    }

    /// Accepts either bare hex or the `sha256:<hex>` form.
    pub fn parse(s: &str) -> Result<Self, StoreError> {
        let hex_part = s.strip_prefix("sha256:").unwrap_or(s).trim();
        let valid = hex_part.len() == 64 && hex_part.bytes().all(|b| b.is_ascii_hexdigit());
        if !valid {
            return Err(StoreError::InvalidDigest(s.to_string()));
        }
        Ok(Digest(hex_part.to_ascii_lowercase()))
    }

    pub fn hex(&self) -> &str {
        &self.0
    }

    /// Hash a file on disk without loading it whole.
    pub async fn of_file(path: &Path) -> Result<Self, StoreError> {
        let mut file = File::open(path)
            .await
            .map_err(|e| StoreError::io(path, e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file
                .read(&mut buf)
                .await
                .map_err(|e| StoreError::io(path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(Digest(hex::encode(hasher.finalize())))
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256:{}", self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.0)
    }
}

impl TryFrom<String> for Digest {
    type Error = StoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Digest::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(d: Digest) -> Self {
        d.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Path relative to the generation directory, `/` separated.
    pub path: String,
    pub size: u64,
    pub sha256: Digest,
}

/// Written into every committed generation. It is the only input needed to
/// derive the target configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub generation: GenerationId,
    pub committed_at: DateTime<Utc>,
    pub files: Vec<ManifestEntry>,
}

/// Reject anything that could escape the generation directory.
pub fn validate_resource_path(path: &str) -> Result<(), StoreError> {
    if path.is_empty() {
        return Err(StoreError::InvalidPath("empty path".to_string()));
    }
    let p = Path::new(path);
    for component in p.components() {
        match component {
            Component::Normal(_) => {}
            _ => return Err(StoreError::InvalidPath(path.to_string())),
        }
    }
    if p.file_name().and_then(|n| n.to_str()) == Some(crate::paths::MANIFEST_FILE)
        && p.components().count() == 1
    {
        return Err(StoreError::InvalidPath(format!(
            "{path} is reserved for the generation manifest"
        )));
    }
    Ok(())
}
