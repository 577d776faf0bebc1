use crate::fingerprint::Fingerprint;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// One completed indexing cycle. Never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct SnapshotRecord {
    pub repo_key: String,
    pub snapshot_id: String,
    /// ISO-8601 UTC. Kept as text so a hand-edited or foreign value survives a
    /// load/save round trip instead of failing the whole document.
    pub indexed_at: String,
    pub repo_path: String,
    #[serde(default)]
    pub codebase_hash: Option<Fingerprint>,
}

impl SnapshotRecord {
    #[must_use]
    pub fn indexed_at_utc(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.indexed_at)
    }

    /// Unparsable timestamps order before every parsable one.
    pub(crate) fn chronological_cmp(&self, other: &Self) -> Ordering {
        self.indexed_at_utc()
            .cmp(&other.indexed_at_utc())
            .then_with(|| self.indexed_at.cmp(&other.indexed_at))
    }
}

/// The single persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
pub struct IndexState {
    #[serde(default)]
    pub codebase_hash: Option<Fingerprint>,
    /// Absolute repository path of the last successful index. Stored under the
    /// historical `indexed_at` key for on-disk compatibility.
    #[serde(default, rename = "indexed_at")]
    pub indexed_path_marker: Option<String>,
    #[serde(default)]
    pub snapshots: Vec<SnapshotRecord>,
}

impl IndexState {
    pub fn sort_snapshots(&mut self) {
        self.snapshots.sort_by(SnapshotRecord::chronological_cmp);
    }

    pub fn append_snapshot(&mut self, record: SnapshotRecord) {
        self.snapshots.push(record);
        self.sort_snapshots();
    }

    /// Returns how many records were dropped.
    pub fn remove_snapshots(&mut self, snapshot_ids: &HashSet<String>) -> usize {
        let before = self.snapshots.len();
        self.snapshots
            .retain(|snap| !snapshot_ids.contains(&snap.snapshot_id));
        before - self.snapshots.len()
    }

    pub fn snapshots_for<'a>(
        &'a self,
        repo_key: &'a str,
    ) -> impl Iterator<Item = &'a SnapshotRecord> + 'a {
        self.snapshots.iter().filter(move |s| s.repo_key == repo_key)
    }

    #[must_use]
    pub fn latest_snapshot_for(&self, repo_key: &str) -> Option<&SnapshotRecord> {
        self.snapshots
            .iter()
            .filter(|s| s.repo_key == repo_key)
            .max_by(|a, b| a.chronological_cmp(b))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    HashMissing,
    PathMarkerMissing,
    PathMoved,
    FingerprintChanged,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq, JsonSchema)]
pub struct StaleAssessment {
    pub stale: bool,
    pub reasons: Vec<StaleReason>,
}

/// `current` is only evaluated when the cheap checks pass.
pub fn assess_staleness(
    state: &IndexState,
    repo_root: &Path,
    current: impl FnOnce() -> Fingerprint,
) -> StaleAssessment {
    let mut reasons = Vec::new();

    if state.codebase_hash.is_none() {
        reasons.push(StaleReason::HashMissing);
    }
    match state.indexed_path_marker.as_deref() {
        None => reasons.push(StaleReason::PathMarkerMissing),
        Some(marker) => {
            if resolve_marker(marker) != repo_root {
                reasons.push(StaleReason::PathMoved);
            }
        }
    }

    if reasons.is_empty() && state.codebase_hash.as_ref() != Some(&current()) {
        reasons.push(StaleReason::FingerprintChanged);
    }

    let stale = !reasons.is_empty();
    StaleAssessment { stale, reasons }
}

fn resolve_marker(marker: &str) -> PathBuf {
    let path = PathBuf::from(marker);
    path.canonicalize().unwrap_or(path)
}

#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// RFC 3339, or a zone-less ISO-8601 value read as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
