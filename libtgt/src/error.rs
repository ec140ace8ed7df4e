use std::io;
use std::path::PathBuf;

use common::ErrorClass;
use libbootres::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("target daemon at {socket:?} is unreachable: {source}")]
    Unreachable {
        socket: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("target daemon did not answer {request:?} within the timeout")]
    Timeout { request: String },

    #[error("target daemon rejected {request:?}: {message}")]
    Rejected { request: String, message: String },

    #[error("unexpected reply from target daemon: {0:?}")]
    Protocol(String),

    #[error("IO error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("malformed reconciler state {path:?}: {source}")]
    State {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl TargetError {
    pub fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        TargetError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            TargetError::Unreachable { source, .. } => ErrorClass::from_io(source),
            TargetError::Timeout { .. }
            | TargetError::Rejected { .. }
            | TargetError::Protocol(_) => ErrorClass::TransientExternalFailure,
            TargetError::Io { source, .. } if source.kind() == io::ErrorKind::PermissionDenied => {
                ErrorClass::PermissionDenied
            }
            TargetError::Io { .. } | TargetError::State { .. } => ErrorClass::Fatal,
            TargetError::Store(e) => e.class(),
        }
    }
}
