use std::io;
use std::path::PathBuf;

use common::ErrorClass;
use thiserror::Error;

use crate::GenerationId;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("generation {0} is already being written")]
    WriterBusy(GenerationId),

    #[error("the writer lock {0:?} is held by another process")]
    WriterLocked(PathBuf),

    #[error("generation {0} is not being written")]
    UnknownGeneration(GenerationId),

    #[error("generation {0} does not exist")]
    GenerationNotFound(GenerationId),

    #[error("invalid resource path: {0}")]
    InvalidPath(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("digest mismatch for {path}: expected {expected}, got {actual}")]
    DigestMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed manifest {path:?}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            StoreError::DigestMismatch { .. } => ErrorClass::CorruptGeneration,
            StoreError::WriterBusy(_) | StoreError::WriterLocked(_) => {
                ErrorClass::TransientExternalFailure
            }
            StoreError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                ErrorClass::PermissionDenied
            }
            _ => ErrorClass::Fatal,
        }
    }
}
