//! # Context Index Keeper
//!
//! Decides when a derived code index must be rebuilt, records every rebuild as
//! an immutable snapshot, and prunes old snapshots under a time/count policy.
//!
//! ## Flow
//!
//! ```text
//! file changes
//!     │
//!     ├──> BatchDebouncer (quiet period / batch size)
//!     │      └─> UpdateCoordinator::smart_update (significant files only)
//!     │
//!     ├──> UpdateCoordinator::update
//!     │      ├─> fingerprint compare (SHA-256 over tracked files)
//!     │      ├─> IndexingPipeline::run
//!     │      └─> IndexStateStore::save (new SnapshotRecord)
//!     │
//!     └──> retention::plan ─> IndexingPipeline::delete_snapshot + state update
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use context_index_keeper::{CommandPipeline, EngineConfig, UpdateCoordinator};
//! use std::sync::Arc;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = EngineConfig::from_env()?;
//!     let pipeline = CommandPipeline::new("graph-indexer", config.pipeline_timeout);
//!     let coordinator = UpdateCoordinator::new("/path/to/repo", config, Arc::new(pipeline))?;
//!
//!     if coordinator.update(false) {
//!         println!("{}", serde_json::to_string_pretty(&coordinator.status())?);
//!     }
//!     Ok(())
//! }
//! ```

mod clock;
mod config;
mod coordinator;
mod debounce;
mod error;
mod fingerprint;
mod index_state;
mod pipeline;
mod repo;
pub mod retention;
mod state_io;
mod watch;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DebounceConfig, EngineConfig, SignificantFiles, STATE_DIR_NAME};
pub use coordinator::{CleanupReport, CyclePhase, IndexStatus, UpdateCoordinator};
pub use debounce::{BatchDebouncer, ChangeSink, Scheduler, TimerHandle, TimerTask, TokioScheduler};
pub use error::{KeeperError, Result};
pub use fingerprint::{CodebaseFingerprinter, Fingerprint};
pub use index_state::{
    assess_staleness, format_timestamp, parse_timestamp, IndexState, SnapshotRecord,
    StaleAssessment, StaleReason,
};
pub use pipeline::{CommandPipeline, ExtractedGraphSummary, IndexingPipeline};
pub use repo::{repo_key, sanitize_remote_url, GitMetadata, RepoMetadata, UntrackedMetadata};
pub use retention::{DeletionReason, PlannedDeletion, RetentionPolicy};
pub use state_io::IndexStateStore;
pub use watch::ChangeWatcher;
