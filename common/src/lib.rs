pub mod backoff;
pub mod config;
pub mod error;
pub mod secret;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use backoff::{BackoffPolicy, ExponentialBackoff};
pub use config::{ClusterConfig, ConfigError};
pub use error::ErrorClass;
pub use secret::SharedSecret;

/// Identity of a region worker slot. Passed to the worker process as its
/// numeric argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for WorkerId {
    fn from(v: u32) -> Self {
        WorkerId(v)
    }
}

/// Result of an administrative operation that is safe to re-run.
///
/// Operations report `NoOp` when their precondition shows the work was
/// already done, so repeated invocations can be observed and tested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Changed,
    NoOp,
}

impl Outcome {
    pub fn changed(self) -> bool {
        matches!(self, Outcome::Changed)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Changed => write!(f, "changed"),
            Outcome::NoOp => write!(f, "no change"),
        }
    }
}
