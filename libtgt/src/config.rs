use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use libbootres::{GenerationId, Manifest};
use sha2::{Digest, Sha256};

static IQN_PREFIX: &str = "iqn.2004-05.com.ubuntu:maas";

/// One exposed boot image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LunDefinition {
    pub target_name: String,
    pub backing_store: PathBuf,
    pub readonly: bool,
}

/// Target daemon configuration derived from a generation manifest.
///
/// Always rendered in full; the daemon is never patched incrementally.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetConfig {
    pub generation: Option<GenerationId>,
    pub luns: Vec<LunDefinition>,
}

impl TargetConfig {
    /// Placeholder used when no generation is current yet.
    pub fn empty() -> Self {
        TargetConfig {
            generation: None,
            luns: Vec::new(),
        }
    }

    pub fn from_manifest(manifest: &Manifest, generation_dir: &Path) -> Self {
        let luns = manifest
            .files
            .iter()
            .map(|entry| LunDefinition {
                target_name: target_name(manifest.generation, &entry.path),
                backing_store: generation_dir.join(&entry.path),
                readonly: true,
            })
            .collect();
        TargetConfig {
            generation: Some(manifest.generation),
            luns,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.luns.is_empty()
    }

    /// Render in tgt-admin configuration syntax.
    pub fn render(&self) -> String {
        let mut out = String::from("# Generated by rackd, do not edit.\n");
        match self.generation {
            Some(g) => {
                let _ = writeln!(out, "# generation: {g}");
            }
            None => out.push_str("# generation: none (no boot resources yet)\n"),
        }
        for lun in &self.luns {
            let _ = writeln!(out, "\n<target {}>", lun.target_name);
            if lun.readonly {
                out.push_str("    readonly 1\n");
            }
            out.push_str("    allow-in-use yes\n");
            let _ = writeln!(out, "    backing-store {}", lun.backing_store.display());
            out.push_str("    driver iscsi\n");
            out.push_str("</target>\n");
        }
        out
    }

    /// Digest of the rendered configuration, used to detect no-op applies.
    pub fn digest(&self) -> String {
        hex::encode(Sha256::digest(self.render().as_bytes()))
    }
}

/// IQN for a resource file.
///
/// Lower-case letters, digits, `.` and `-` are kept and `/` becomes `:`.
/// Upper-case letters are folded and any other character becomes `-`; such
/// a name then carries a short digest of the exact path, so distinct paths
/// never share a target.
pub fn target_name(generation: GenerationId, path: &str) -> String {
    let mut lossy = false;
    let mut suffix: String = path
        .chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '.' | '-' => c,
            '/' => ':',
            'A'..='Z' => {
                lossy = true;
                c.to_ascii_lowercase()
            }
            _ => {
                lossy = true;
                '-'
            }
        })
        .collect();
    if lossy {
        let digest = hex::encode(Sha256::digest(path.as_bytes()));
        let _ = write!(suffix, ".{}", &digest[..16]);
    }
    format!("{IQN_PREFIX}:{generation}-{suffix}")
}
