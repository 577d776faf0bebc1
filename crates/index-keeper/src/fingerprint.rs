use crate::config::SignificantFiles;
use crate::repo::RepoMetadata;
use ignore::WalkBuilder;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Component, Path};
use std::sync::Arc;

/// SHA-256 hex digest over every tracked path and its bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct CodebaseFingerprinter {
    metadata: Arc<dyn RepoMetadata>,
    files: SignificantFiles,
}

impl CodebaseFingerprinter {
    pub fn new(metadata: Arc<dyn RepoMetadata>, files: SignificantFiles) -> Self {
        Self { metadata, files }
    }

    /// Best effort: unreadable files are skipped, never reported as errors.
    pub fn compute(&self, repo_root: &Path) -> Fingerprint {
        let mut paths = self.tracked_paths(repo_root);
        paths.sort();
        paths.dedup();

        let mut hasher = Sha256::new();
        for rel in &paths {
            match std::fs::read(repo_root.join(rel)) {
                Ok(bytes) => {
                    // path, NUL, little-endian u64 length, bytes
                    hasher.update(rel.as_bytes());
                    hasher.update([0u8]);
                    hasher.update((bytes.len() as u64).to_le_bytes());
                    hasher.update(&bytes);
                }
                Err(err) => log::debug!("Skipping unreadable file {rel}: {err}"),
            }
        }
        Fingerprint(format!("{:x}", hasher.finalize()))
    }

    fn tracked_paths(&self, repo_root: &Path) -> Vec<String> {
        match self.metadata.list_tracked_files(repo_root) {
            Ok(paths) => paths,
            Err(err) => {
                log::debug!(
                    "Tracked file listing unavailable for {} ({err:#}); scanning filesystem",
                    repo_root.display()
                );
                self.scan(repo_root)
            }
        }
    }

    fn scan(&self, repo_root: &Path) -> Vec<String> {
        WalkBuilder::new(repo_root)
            .follow_links(false)
            .build()
            .filter_map(|entry| match entry {
                Ok(entry) => Some(entry),
                Err(err) => {
                    log::debug!("Walk error under {}: {err}", repo_root.display());
                    None
                }
            })
            .filter(|entry| entry.file_type().is_some_and(|ft| ft.is_file()))
            .filter(|entry| self.files.matches(entry.path()))
            .filter_map(|entry| {
                let rel = entry.path().strip_prefix(repo_root).ok()?;
                Some(portable_relative_path(rel))
            })
            .collect()
    }
}

/// `/`-joined so the digest does not depend on the host separator.
fn portable_relative_path(rel: &Path) -> String {
    rel.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
