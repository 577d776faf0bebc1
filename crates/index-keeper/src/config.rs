use crate::error::{KeeperError, Result};
use crate::retention::RetentionPolicy;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_STATE_PATH: &str = "CONTEXT_INDEX_STATE_PATH";
pub const ENV_RETENTION_DAYS: &str = "CONTEXT_INDEX_RETENTION_DAYS";
pub const ENV_MAX_SNAPSHOTS: &str = "CONTEXT_INDEX_MAX_SNAPSHOTS";
pub const ENV_DEBOUNCE_MS: &str = "CONTEXT_INDEX_DEBOUNCE_MS";
pub const ENV_MAX_BATCH: &str = "CONTEXT_INDEX_MAX_BATCH";
pub const ENV_PIPELINE_TIMEOUT_SECS: &str = "CONTEXT_INDEX_PIPELINE_TIMEOUT_SECS";

/// Directory (relative to the repository) holding the engine's own files.
pub const STATE_DIR_NAME: &str = ".context-index";
const STATE_FILE_NAME: &str = "index_state.json";

const DEFAULT_EXTENSIONS: &[&str] = &[
    "rs", "py", "pyi", "js", "jsx", "mjs", "cjs", "ts", "tsx", "go", "java", "kt", "kts",
    "scala", "c", "h", "cc", "cpp", "cxx", "hpp", "cs", "rb", "php", "swift", "m", "mm", "lua",
    "sh", "sql", "vue", "svelte",
];

const DEFAULT_MANIFESTS: &[&str] = &[
    "Cargo.toml",
    "Cargo.lock",
    "package.json",
    "package-lock.json",
    "yarn.lock",
    "pnpm-lock.yaml",
    "requirements.txt",
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    "Pipfile",
    "poetry.lock",
    "go.mod",
    "go.sum",
    "pom.xml",
    "build.gradle",
    "build.gradle.kts",
    "Gemfile",
    "Gemfile.lock",
    "composer.json",
];

/// Which files count as "significant" for reindexing and fingerprinting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignificantFiles {
    extensions: Vec<String>,
    file_names: Vec<String>,
}

impl Default for SignificantFiles {
    fn default() -> Self {
        Self::new(
            DEFAULT_EXTENSIONS.iter().map(|s| (*s).to_string()),
            DEFAULT_MANIFESTS.iter().map(|s| (*s).to_string()),
        )
    }
}

impl SignificantFiles {
    pub fn new(
        extensions: impl IntoIterator<Item = String>,
        file_names: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            extensions: extensions
                .into_iter()
                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                .filter(|ext| !ext.is_empty())
                .collect(),
            file_names: file_names.into_iter().collect(),
        }
    }

    #[must_use]
    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if self.file_names.iter().any(|f| f == name) {
            return true;
        }
        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|e| *e == ext)
            })
            .unwrap_or(false)
    }

    pub fn extensions(&self) -> &[String] {
        &self.extensions
    }

    pub fn file_names(&self) -> &[String] {
        &self.file_names
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DebounceConfig {
    pub quiet_period: Duration,
    pub max_batch_size: usize,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_secs(2),
            max_batch_size: 50,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Explicit state file; `None` means `<repo>/.context-index/index_state.json`.
    pub state_path: Option<PathBuf>,
    pub retention: RetentionPolicy,
    pub debounce: DebounceConfig,
    pub pipeline_timeout: Duration,
    pub files: SignificantFiles,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_path: None,
            retention: RetentionPolicy::default(),
            debounce: DebounceConfig::default(),
            pipeline_timeout: Duration::from_secs(30 * 60),
            files: SignificantFiles::default(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    state_path: Option<PathBuf>,
    retention_days: Option<i64>,
    max_snapshots_per_repo: Option<i64>,
    debounce_ms: Option<u64>,
    max_batch_size: Option<usize>,
    pipeline_timeout_secs: Option<u64>,
    significant_extensions: Option<Vec<String>>,
    significant_file_names: Option<Vec<String>>,
}

impl EngineConfig {
    /// Defaults overlaid with `CONTEXT_INDEX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let file: ConfigFile = toml::from_str(raw)?;
        let mut config = Self::default();

        config.state_path = file.state_path;
        if let Some(days) = file.retention_days {
            config.retention.retention_days = non_negative("retention_days", days)?;
        }
        if let Some(max) = file.max_snapshots_per_repo {
            config.retention.max_snapshots_per_repo =
                non_negative("max_snapshots_per_repo", max)?;
        }
        if let Some(ms) = file.debounce_ms {
            config.debounce.quiet_period = Duration::from_millis(ms);
        }
        if let Some(size) = file.max_batch_size {
            config.debounce.max_batch_size = size;
        }
        if let Some(secs) = file.pipeline_timeout_secs {
            config.pipeline_timeout = Duration::from_secs(secs);
        }
        if file.significant_extensions.is_some() || file.significant_file_names.is_some() {
            let defaults = SignificantFiles::default();
            config.files = SignificantFiles::new(
                file.significant_extensions
                    .unwrap_or_else(|| defaults.extensions().to_vec()),
                file.significant_file_names
                    .unwrap_or_else(|| defaults.file_names().to_vec()),
            );
        }

        config.validate()?;
        Ok(config)
    }

    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(path) = lookup(ENV_STATE_PATH).filter(|v| !v.trim().is_empty()) {
            self.state_path = Some(PathBuf::from(path.trim()));
        }
        if let Some(raw) = lookup(ENV_RETENTION_DAYS) {
            self.retention.retention_days =
                non_negative(ENV_RETENTION_DAYS, parse_int(ENV_RETENTION_DAYS, &raw)?)?;
        }
        if let Some(raw) = lookup(ENV_MAX_SNAPSHOTS) {
            self.retention.max_snapshots_per_repo =
                non_negative(ENV_MAX_SNAPSHOTS, parse_int(ENV_MAX_SNAPSHOTS, &raw)?)?;
        }
        if let Some(raw) = lookup(ENV_DEBOUNCE_MS) {
            let ms: u64 = non_negative(ENV_DEBOUNCE_MS, parse_int(ENV_DEBOUNCE_MS, &raw)?)?;
            self.debounce.quiet_period = Duration::from_millis(ms);
        }
        if let Some(raw) = lookup(ENV_MAX_BATCH) {
            self.debounce.max_batch_size =
                non_negative(ENV_MAX_BATCH, parse_int(ENV_MAX_BATCH, &raw)?)?;
        }
        if let Some(raw) = lookup(ENV_PIPELINE_TIMEOUT_SECS) {
            let secs: u64 = non_negative(
                ENV_PIPELINE_TIMEOUT_SECS,
                parse_int(ENV_PIPELINE_TIMEOUT_SECS, &raw)?,
            )?;
            self.pipeline_timeout = Duration::from_secs(secs);
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if self.debounce.max_batch_size == 0 {
            return Err(KeeperError::InvalidConfig(
                "max_batch_size must be at least 1".to_string(),
            ));
        }
        if self.pipeline_timeout.is_zero() {
            return Err(KeeperError::InvalidConfig(
                "pipeline timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn state_path_for(&self, repo_root: &Path) -> PathBuf {
        self.state_path
            .clone()
            .unwrap_or_else(|| repo_root.join(STATE_DIR_NAME).join(STATE_FILE_NAME))
    }
}

fn parse_int(key: &str, raw: &str) -> Result<i64> {
    raw.trim()
        .parse::<i64>()
        .map_err(|e| KeeperError::InvalidConfig(format!("{key}={raw:?}: {e}")))
}

fn non_negative<T: TryFrom<i64>>(key: &str, value: i64) -> Result<T> {
    if value < 0 {
        return Err(KeeperError::InvalidConfig(format!(
            "{key} must not be negative (got {value})"
        )));
    }
    T::try_from(value).map_err(|_| KeeperError::InvalidConfig(format!("{key} is out of range")))
}
