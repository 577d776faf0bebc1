use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{KeeperError, Result};
use crate::fingerprint::{CodebaseFingerprinter, Fingerprint};
use crate::index_state::{assess_staleness, format_timestamp, SnapshotRecord, StaleAssessment};
use crate::pipeline::IndexingPipeline;
use crate::repo::{repo_key, GitMetadata, RepoMetadata};
use crate::retention::{self, PlannedDeletion};
use crate::state_io::IndexStateStore;
use once_cell::sync::OnceCell;
use schemars::JsonSchema;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Where the coordinator is within an indexing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Checking,
    Indexing,
    Recording,
    Cleaning,
    Failed,
}

#[derive(Debug, Clone, Default, Serialize, JsonSchema)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub planned: Vec<PlannedDeletion>,
    /// Bookkeeping records dropped from the state file.
    pub removed: usize,
    /// Backing-store deletions that failed (their records are still dropped).
    pub deletion_failures: usize,
}

#[derive(Debug, Clone, Serialize, JsonSchema)]
pub struct IndexStatus {
    pub repo_key: String,
    pub repo_path: String,
    pub phase: CyclePhase,
    pub staleness: StaleAssessment,
    pub snapshot_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_snapshot: Option<SnapshotRecord>,
}

/// Decides when the codebase needs reindexing, runs the pipeline, records
/// snapshots and enforces retention. One instance per repository checkout.
pub struct UpdateCoordinator {
    root: PathBuf,
    config: EngineConfig,
    store: IndexStateStore,
    pipeline: Arc<dyn IndexingPipeline>,
    metadata: Arc<dyn RepoMetadata>,
    fingerprinter: CodebaseFingerprinter,
    clock: Arc<dyn Clock>,
    repo_key: OnceCell<String>,
    phase: Mutex<CyclePhase>,
    // one cycle at a time per instance
    cycle: Mutex<()>,
}

impl UpdateCoordinator {
    pub fn new(
        root: impl AsRef<Path>,
        config: EngineConfig,
        pipeline: Arc<dyn IndexingPipeline>,
    ) -> Result<Self> {
        config.validate()?;
        let root = root.as_ref();
        let root = root.canonicalize().map_err(|e| {
            KeeperError::InvalidPath(format!("{}: {e}", root.display()))
        })?;
        if !root.is_dir() {
            return Err(KeeperError::InvalidPath(format!(
                "Not a directory: {}",
                root.display()
            )));
        }

        let metadata: Arc<dyn RepoMetadata> = Arc::new(GitMetadata);
        let store = IndexStateStore::new(config.state_path_for(&root));
        let fingerprinter = CodebaseFingerprinter::new(metadata.clone(), config.files.clone());

        Ok(Self {
            root,
            config,
            store,
            pipeline,
            metadata,
            fingerprinter,
            clock: Arc::new(SystemClock),
            repo_key: OnceCell::new(),
            phase: Mutex::new(CyclePhase::Idle),
            cycle: Mutex::new(()),
        })
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: Arc<dyn RepoMetadata>) -> Self {
        self.fingerprinter =
            CodebaseFingerprinter::new(metadata.clone(), self.config.files.clone());
        self.metadata = metadata;
        self.repo_key = OnceCell::new();
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &IndexStateStore {
        &self.store
    }

    /// Path plus sanitized remote, resolved once per instance.
    pub fn repo_key(&self) -> &str {
        self.repo_key.get_or_init(|| {
            let remote = match self.metadata.remote_url(&self.root) {
                Ok(remote) => remote,
                Err(err) => {
                    log::debug!("Remote URL unavailable for {}: {err:#}", self.root.display());
                    None
                }
            };
            repo_key(&self.root, remote.as_deref())
        })
    }

    pub fn phase(&self) -> CyclePhase {
        *lock(&self.phase)
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprinter.compute(&self.root)
    }

    pub fn assess_staleness(&self) -> StaleAssessment {
        let state = self.store.load();
        assess_staleness(&state, &self.root, || self.fingerprint())
    }

    pub fn is_stale(&self) -> bool {
        self.assess_staleness().stale
    }

    /// Runs one cycle. `false` only when the pipeline (or recording its
    /// result) failed; an up-to-date index is a successful no-op.
    pub fn update(&self, force: bool) -> bool {
        let _cycle = lock(&self.cycle);

        self.set_phase(CyclePhase::Checking);
        if !force {
            let assessment = self.assess_staleness();
            if !assessment.stale {
                log::debug!("Index for {} is up to date", self.root.display());
                self.set_phase(CyclePhase::Idle);
                return true;
            }
            log::info!(
                "Index for {} is stale: {:?}",
                self.root.display(),
                assessment.reasons
            );
        }

        self.set_phase(CyclePhase::Indexing);
        let snapshot_id = Uuid::new_v4().simple().to_string();
        let indexed_at = self.clock.now();

        match self.pipeline.run(&self.root) {
            Ok(summary) => log::info!(
                "Indexed {}: {} files, {} entities, {} relationships",
                self.root.display(),
                summary.files,
                summary.entities,
                summary.relationships
            ),
            Err(err) => {
                log::error!("Indexing pipeline failed for {}: {err:#}", self.root.display());
                self.fail_cycle();
                return false;
            }
        }

        self.set_phase(CyclePhase::Recording);
        let codebase_hash = self.fingerprint();
        let mut state = self.store.load();
        state.codebase_hash = Some(codebase_hash.clone());
        state.indexed_path_marker = Some(self.root.to_string_lossy().into_owned());
        state.append_snapshot(SnapshotRecord {
            repo_key: self.repo_key().to_string(),
            snapshot_id: snapshot_id.clone(),
            indexed_at: format_timestamp(indexed_at),
            repo_path: self.root.to_string_lossy().into_owned(),
            codebase_hash: Some(codebase_hash),
        });
        if let Err(err) = self.store.save(&state) {
            log::error!(
                "Failed to persist index state {}: {err}",
                self.store.path().display()
            );
            self.fail_cycle();
            return false;
        }
        log::debug!("Recorded snapshot {snapshot_id}");

        self.set_phase(CyclePhase::Cleaning);
        if let Err(err) = self.enforce_retention(&state.snapshots, false) {
            log::warn!("Snapshot cleanup failed: {err}");
        }

        self.set_phase(CyclePhase::Idle);
        true
    }

    /// Reindexes only when a significant file is among `changed_files`.
    pub fn smart_update(&self, changed_files: &[PathBuf]) -> bool {
        let significant = changed_files
            .iter()
            .filter(|path| self.config.files.matches(path))
            .count();
        if significant == 0 {
            log::debug!(
                "No significant files among {} changes; skipping update",
                changed_files.len()
            );
            return true;
        }
        log::debug!("{significant} significant file(s) changed");
        self.update(false)
    }

    /// Applies the retention policy to the persisted snapshot list.
    pub fn cleanup(&self, dry_run: bool) -> Result<CleanupReport> {
        let _cycle = lock(&self.cycle);
        self.enforce_retention(&self.store.load().snapshots, dry_run)
    }

    pub fn status(&self) -> IndexStatus {
        let state = self.store.load();
        let repo_key = self.repo_key().to_string();
        IndexStatus {
            snapshot_count: state.snapshots_for(&repo_key).count(),
            latest_snapshot: state.latest_snapshot_for(&repo_key).cloned(),
            staleness: assess_staleness(&state, &self.root, || self.fingerprint()),
            phase: self.phase(),
            repo_path: self.root.to_string_lossy().into_owned(),
            repo_key,
        }
    }

    fn enforce_retention(
        &self,
        snapshots: &[SnapshotRecord],
        dry_run: bool,
    ) -> Result<CleanupReport> {
        let planned = retention::plan(snapshots, self.clock.now(), self.config.retention);
        let mut report = CleanupReport {
            dry_run,
            ..CleanupReport::default()
        };
        if planned.is_empty() {
            return Ok(report);
        }
        if dry_run {
            for item in &planned {
                log::info!(
                    "Would delete snapshot {} of {} ({})",
                    item.snapshot.snapshot_id,
                    item.snapshot.repo_key,
                    item.reason.as_str()
                );
            }
            report.planned = planned;
            return Ok(report);
        }

        let mut ids = HashSet::with_capacity(planned.len());
        for item in &planned {
            if let Err(err) = self.pipeline.delete_snapshot(&item.snapshot) {
                report.deletion_failures += 1;
                log::warn!(
                    "Failed to delete stored data for snapshot {}: {err:#}",
                    item.snapshot.snapshot_id
                );
            }
            ids.insert(item.snapshot.snapshot_id.clone());
        }

        report.removed = self.store.apply_deletions(&ids)?;
        log::info!(
            "Snapshot cleanup removed {} record(s), {} backing deletion failure(s)",
            report.removed,
            report.deletion_failures
        );
        report.planned = planned;
        Ok(report)
    }

    fn set_phase(&self, phase: CyclePhase) {
        log::debug!("Cycle phase -> {phase:?}");
        *lock(&self.phase) = phase;
    }

    fn fail_cycle(&self) {
        self.set_phase(CyclePhase::Failed);
        self.set_phase(CyclePhase::Idle);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}
