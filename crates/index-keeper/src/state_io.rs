use crate::error::Result;
use crate::index_state::IndexState;
use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// Loads and persists the [`IndexState`] document.
#[derive(Debug, Clone)]
pub struct IndexStateStore {
    path: PathBuf,
}

impl IndexStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Missing or corrupt files yield an empty state; staleness then degrades
    /// to "reindex" instead of failing.
    pub fn load(&self) -> IndexState {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return IndexState::default(),
            Err(err) => {
                log::warn!(
                    "Failed to read index state {}: {err}; treating as empty",
                    self.path.display()
                );
                return IndexState::default();
            }
        };

        let value: serde_json::Value = match serde_json::from_slice(&raw) {
            Ok(value) => value,
            Err(err) => {
                log::warn!(
                    "Index state {} is not valid JSON ({err}); treating as empty",
                    self.path.display()
                );
                return IndexState::default();
            }
        };
        if !value.is_object() {
            log::warn!(
                "Index state {} is not a JSON object; treating as empty",
                self.path.display()
            );
            return IndexState::default();
        }

        match serde_json::from_value::<IndexState>(value) {
            Ok(mut state) => {
                state.sort_snapshots();
                state
            }
            Err(err) => {
                log::warn!(
                    "Index state {} has an unexpected shape ({err}); treating as empty",
                    self.path.display()
                );
                IndexState::default()
            }
        }
    }

    /// Write-then-rename so concurrent readers see the old or the new
    /// document, never a partial one.
    pub fn save(&self, state: &IndexState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        if let Err(err) = fs::rename(&tmp, &self.path) {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        Ok(())
    }

    /// Drops the given snapshot records and persists; returns how many were removed.
    pub fn apply_deletions(&self, snapshot_ids: &HashSet<String>) -> Result<usize> {
        let mut state = self.load();
        let removed = state.remove_snapshots(snapshot_ids);
        if removed > 0 {
            self.save(&state)?;
        }
        Ok(removed)
    }
}
