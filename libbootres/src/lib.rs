pub mod error;
pub mod manifest;
pub mod paths;
pub mod store;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use error::StoreError;
pub use manifest::{Digest, Manifest, ManifestEntry};
pub use store::{BootResourceStore, CommitOutcome, CurrentPointer};

/// Monotonic identifier of a boot resource generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationId(pub u64);

impl GenerationId {
    /// Directory name of the generation. Zero padded so that lexical order
    /// matches numeric order.
    pub fn dir_name(&self) -> String {
        format!("{:020}", self.0)
    }

    pub fn next(&self) -> GenerationId {
        GenerationId(self.0 + 1)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for GenerationId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(GenerationId)
    }
}
