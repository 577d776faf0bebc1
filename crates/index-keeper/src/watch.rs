use crate::config::STATE_DIR_NAME;
use crate::debounce::BatchDebouncer;
use crate::error::{KeeperError, Result};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::Duration;

const IGNORED_TOP_LEVEL: &[&str] = &[
    ".git",
    ".hg",
    ".svn",
    STATE_DIR_NAME,
    "target",
    "node_modules",
    "dist",
    "build",
    "out",
    "__pycache__",
    ".venv",
];

/// Feeds filesystem events under a repository into a [`BatchDebouncer`].
/// Watching stops when this is dropped.
pub struct ChangeWatcher {
    root: PathBuf,
    _watcher: RecommendedWatcher,
}

impl ChangeWatcher {
    pub fn start(root: impl AsRef<Path>, debouncer: BatchDebouncer) -> Result<Self> {
        Self::start_with_poll_interval(root, debouncer, Duration::from_secs(2))
    }

    pub fn start_with_poll_interval(
        root: impl AsRef<Path>,
        debouncer: BatchDebouncer,
        poll_interval: Duration,
    ) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let event_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    let paths = relevant_paths(&event_root, event);
                    if !paths.is_empty() {
                        debouncer.notify(paths);
                    }
                }
                Err(err) => log::warn!("Watcher error: {err}"),
            },
            NotifyConfig::default().with_poll_interval(poll_interval),
        )
        .map_err(|e| KeeperError::WatcherError(format!("watcher init failed: {e}")))?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .map_err(|e| {
                KeeperError::WatcherError(format!("failed to watch {}: {e}", root.display()))
            })?;
        log::info!("Watching {} for changes", root.display());

        Ok(Self {
            root,
            _watcher: watcher,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn relevant_paths(root: &Path, event: Event) -> Vec<PathBuf> {
    if matches!(event.kind, EventKind::Access(_)) {
        return Vec::new();
    }
    event
        .paths
        .into_iter()
        .filter(|path| is_relevant_path(root, path))
        .collect()
}

pub(crate) fn is_relevant_path(root: &Path, path: &Path) -> bool {
    let Ok(relative) = path.strip_prefix(root) else {
        // events from outside the watched root are not ours to judge
        return true;
    };
    let mut components = relative.components();
    let Some(first) = components.next() else {
        return false;
    };
    let first = first.as_os_str().to_string_lossy();
    if IGNORED_TOP_LEVEL.iter().any(|ignored| first == *ignored) {
        return false;
    }

    // editor swap/backup files
    let name = relative
        .file_name()
        .map(|f| f.to_string_lossy())
        .unwrap_or_default();
    !(name.ends_with('~') || name.ends_with(".swp") || name.starts_with(".#"))
}
