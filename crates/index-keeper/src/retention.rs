//! Time + count retention for snapshot records.
//!
//! Rules, applied per `repo_key`:
//!
//! 1. a key with at most one snapshot is exempt;
//! 2. the chronologically newest snapshot of a key is never planned;
//! 3. *time*: snapshots strictly older than `now - retention_days` are planned;
//! 4. *count*: if more than `max_snapshots_per_repo` survive rule 3, the oldest
//!    survivors are planned until the cap is met.
//!
//! Planning is pure; applying a plan is the coordinator's job.

use crate::index_state::SnapshotRecord;
use chrono::{DateTime, Duration, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub retention_days: u32,
    /// Floored to 1 when planning.
    pub max_snapshots_per_repo: usize,
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            retention_days: 7,
            max_snapshots_per_repo: 9,
        }
    }
}

impl RetentionPolicy {
    #[must_use]
    pub fn effective_max(&self) -> usize {
        self.max_snapshots_per_repo.max(1)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum DeletionReason {
    #[serde(rename = "time")]
    Time,
    #[serde(rename = "count")]
    Count,
    /// Expired, and would also have been cut by the count cap alone.
    #[serde(rename = "time+count")]
    TimeAndCount,
}

impl DeletionReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Time => "time",
            Self::Count => "count",
            Self::TimeAndCount => "time+count",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, JsonSchema)]
pub struct PlannedDeletion {
    pub snapshot: SnapshotRecord,
    pub reason: DeletionReason,
}

#[must_use]
pub fn plan(
    snapshots: &[SnapshotRecord],
    now: DateTime<Utc>,
    policy: RetentionPolicy,
) -> Vec<PlannedDeletion> {
    // a window reaching past the calendar's start expires nothing
    let cutoff = now
        .checked_sub_signed(Duration::days(i64::from(policy.retention_days)))
        .unwrap_or(DateTime::<Utc>::MIN_UTC);
    let max_keep = policy.effective_max();

    let mut by_repo: BTreeMap<&str, Vec<&SnapshotRecord>> = BTreeMap::new();
    for snap in snapshots {
        by_repo.entry(snap.repo_key.as_str()).or_default().push(snap);
    }

    let mut planned = Vec::new();
    for (_, mut group) in by_repo {
        if group.len() <= 1 {
            continue;
        }
        group.sort_by(|a, b| a.chronological_cmp(b));
        planned.extend(plan_group(&group, cutoff, max_keep));
    }
    planned
}

/// `group` is sorted ascending and has at least two entries.
fn plan_group(
    group: &[&SnapshotRecord],
    cutoff: DateTime<Utc>,
    max_keep: usize,
) -> Vec<PlannedDeletion> {
    let candidates = &group[..group.len() - 1];

    let expired: HashSet<usize> = candidates
        .iter()
        .enumerate()
        .filter(|(_, snap)| snap.indexed_at_utc().is_some_and(|ts| ts < cutoff))
        .map(|(idx, _)| idx)
        .collect();

    let remaining = group.len() - expired.len();
    let mut count_budget = remaining.saturating_sub(max_keep);
    // positions the count cap alone would cut
    let count_window = group.len().saturating_sub(max_keep);

    let mut out = Vec::new();
    for (idx, snap) in candidates.iter().enumerate() {
        let reason = if expired.contains(&idx) {
            if idx < count_window {
                DeletionReason::TimeAndCount
            } else {
                DeletionReason::Time
            }
        } else if count_budget > 0 {
            count_budget -= 1;
            DeletionReason::Count
        } else {
            continue;
        };
        out.push(PlannedDeletion {
            snapshot: (*snap).clone(),
            reason,
        });
    }
    out
}
