//! Configuration management for the tube player.
//!
//! Loads settings from a TOML file or uses defaults. Search order:
//! explicit path, `$TUBE_CONFIG`, `$XDG_CONFIG_HOME/tube/config.toml`.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, TubeError};
use crate::types::DistractorLevel;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "TUBE_CONFIG";

/// Progression rules
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressionConfig {
    /// Points awarded per correct answer
    #[serde(default = "default_points_per_correct")]
    pub points_per_correct: u64,

    /// Skip numbers in ascending order; the last entry is the ceiling
    #[serde(default = "default_skip_ladder")]
    pub skip_ladder: Vec<u32>,

    /// Highest distractor level a unit can escalate to
    #[serde(default = "default_distractor_ceiling")]
    pub distractor_ceiling: DistractorLevel,

    /// Number of rotation slots
    #[serde(default = "default_slot_count")]
    pub slot_count: u8,

    /// Threads materialized for a new learner, one per slot
    #[serde(default = "default_threads")]
    pub default_threads: Vec<String>,

    /// Units created when a thread is first materialized
    #[serde(default = "default_units_per_thread")]
    pub units_per_thread: u32,
}

fn default_points_per_correct() -> u64 {
    3
}

fn default_skip_ladder() -> Vec<u32> {
    vec![3, 5, 10, 25, 100]
}

fn default_distractor_ceiling() -> DistractorLevel {
    DistractorLevel::L3
}

fn default_slot_count() -> u8 {
    3
}

fn default_threads() -> Vec<String> {
    vec!["t1".to_string(), "t2".to_string(), "t3".to_string()]
}

fn default_units_per_thread() -> u32 {
    10
}

impl Default for ProgressionConfig {
    fn default() -> Self {
        Self {
            points_per_correct: default_points_per_correct(),
            skip_ladder: default_skip_ladder(),
            distractor_ceiling: default_distractor_ceiling(),
            slot_count: default_slot_count(),
            default_threads: default_threads(),
            units_per_thread: default_units_per_thread(),
        }
    }
}

impl ProgressionConfig {
    /// Skip number given to fresh units
    pub fn first_skip(&self) -> u32 {
        self.skip_ladder.first().copied().unwrap_or(3)
    }

    /// Next rung above `current`, capped at the top of the ladder
    pub fn escalate_skip(&self, current: u32) -> u32 {
        let ceiling = self.skip_ladder.last().copied().unwrap_or(current);
        self.skip_ladder
            .iter()
            .copied()
            .find(|&rung| rung > current)
            .unwrap_or(ceiling.max(current))
    }
}

/// Remote sync settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the state backend; `None` runs local-only
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Window coalescing rapid writes into one remote call
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Push queued snapshots in the background after initialize
    #[serde(default = "default_true")]
    pub replay_on_startup: bool,
}

fn default_debounce_ms() -> u64 {
    500
}

fn default_request_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            debounce_ms: default_debounce_ms(),
            request_timeout_secs: default_request_timeout(),
            replay_on_startup: true,
        }
    }
}

impl SyncConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Content cache settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Share of entries dropped once `max_entries` is exceeded
    #[serde(default = "default_evict_fraction")]
    pub evict_fraction: f64,

    /// Route fetches through the background worker
    #[serde(default = "default_true")]
    pub worker_enabled: bool,

    #[serde(default = "default_worker_timeout")]
    pub worker_timeout_secs: u64,

    /// Positions beyond the ready unit to prefetch per slot
    #[serde(default = "default_prefetch_lookahead")]
    pub prefetch_lookahead: u32,
}

fn default_max_entries() -> usize {
    500
}

fn default_evict_fraction() -> f64 {
    0.2
}

fn default_worker_timeout() -> u64 {
    30
}

fn default_prefetch_lookahead() -> u32 {
    3
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            evict_fraction: default_evict_fraction(),
            worker_enabled: true,
            worker_timeout_secs: default_worker_timeout(),
            prefetch_lookahead: default_prefetch_lookahead(),
        }
    }
}

impl CacheConfig {
    pub fn worker_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_timeout_secs)
    }
}

/// Local durable tiers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_kv_file")]
    pub kv_file: String,

    #[serde(default = "default_sqlite_file")]
    pub sqlite_file: String,

    /// Enables the structured tier and its replay queue
    #[serde(default = "default_true")]
    pub sqlite_enabled: bool,
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("tube")
}

fn default_kv_file() -> String {
    "state.json".to_string()
}

fn default_sqlite_file() -> String {
    "tube.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            kv_file: default_kv_file(),
            sqlite_file: default_sqlite_file(),
            sqlite_enabled: true,
        }
    }
}

impl StorageConfig {
    /// All paths rooted at `data_dir` (tests point this at a tempdir)
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join(&self.kv_file)
    }

    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join(&self.sqlite_file)
    }
}

/// Identity recovery settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfig {
    /// Permit minting an anonymous identity when recovery finds nothing
    #[serde(default)]
    pub allow_anonymous: bool,

    /// Cached auth credential, relative to the data dir
    #[serde(default = "default_credential_file")]
    pub credential_file: String,
}

fn default_credential_file() -> String {
    "credentials.json".to_string()
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            allow_anonymous: false,
            credential_file: default_credential_file(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TubeConfig {
    #[serde(default)]
    pub progression: ProgressionConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub identity: IdentityConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TubeConfig {
    /// Load from the first config file found, or fall back to defaults
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load_from(path);
        }

        for candidate in Self::candidate_paths() {
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Load and validate a specific file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            TubeError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: TubeConfig =
            toml::from_str(content).map_err(|e| TubeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn candidate_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            paths.push(PathBuf::from(env_path));
        }
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("tube").join("config.toml"));
        }
        paths
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.progression;
        if p.skip_ladder.is_empty() {
            return Err(TubeError::Config("skip_ladder must not be empty".into()));
        }
        if p.skip_ladder.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TubeError::Config(
                "skip_ladder must be strictly ascending".into(),
            ));
        }
        if p.skip_ladder[0] == 0 {
            return Err(TubeError::Config("skip numbers must be positive".into()));
        }
        if p.slot_count == 0 {
            return Err(TubeError::Config("slot_count must be at least 1".into()));
        }
        if p.default_threads.len() != p.slot_count as usize {
            return Err(TubeError::Config(format!(
                "default_threads has {} entries, expected {}",
                p.default_threads.len(),
                p.slot_count
            )));
        }
        if self.cache.max_entries == 0 {
            return Err(TubeError::Config("cache.max_entries must be positive".into()));
        }
        if !(self.cache.evict_fraction > 0.0 && self.cache.evict_fraction <= 1.0) {
            return Err(TubeError::Config(
                "cache.evict_fraction must be in (0, 1]".into(),
            ));
        }
        if self.sync.debounce_ms == 0 {
            warn!("sync.debounce_ms is 0; every write triggers its own remote sync");
        }
        Ok(())
    }
}
