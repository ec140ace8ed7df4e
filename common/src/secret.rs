use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rand::RngCore;
use thiserror::Error;
use tracing::{info, warn};

use crate::Outcome;
use crate::config::{ConfigError, write_atomic};
use crate::error::ErrorClass;

const SECRET_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("shared secret is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    #[error("shared secret is empty")]
    Empty,

    #[error("failed to access shared secret {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Write(#[from] ConfigError),
}

impl SecretError {
    pub fn class(&self) -> ErrorClass {
        match self {
            SecretError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                ErrorClass::PermissionDenied
            }
            SecretError::Write(e) => e.class(),
            _ => ErrorClass::Fatal,
        }
    }
}

/// Credential establishing trust between rack and region controllers.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(Vec<u8>);

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret(<{} bytes>)", self.0.len())
    }
}

impl SharedSecret {
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; SECRET_LEN];
        rand::rng().fill_bytes(&mut bytes);
        SharedSecret(bytes)
    }

    pub fn from_hex(s: &str) -> Result<Self, SecretError> {
        let bytes = hex::decode(s.trim())?;
        if bytes.is_empty() {
            return Err(SecretError::Empty);
        }
        Ok(SharedSecret(bytes))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Read the installed secret, if any.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Option<Self>, SecretError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(content) => Self::from_hex(&content).map(Some),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SecretError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Install this secret at `path` with mode 0600.
    ///
    /// Installing the same secret again is a no-op; installing a different
    /// one rotates it. An unreadable existing secret is overwritten.
    pub fn install<P: AsRef<Path>>(&self, path: P) -> Result<Outcome, SecretError> {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(Some(existing)) if existing == *self => return Ok(Outcome::NoOp),
            Ok(_) => {}
            Err(e @ (SecretError::InvalidHex(_) | SecretError::Empty)) => {
                warn!(path = %path.display(), "replacing malformed shared secret: {e}");
            }
            Err(e) => return Err(e),
        }
        let mut content = self.to_hex();
        content.push('\n');
        write_atomic(path, content.as_bytes(), Some(0o600))?;
        info!(path = %path.display(), "shared secret installed");
        Ok(Outcome::Changed)
    }
}
