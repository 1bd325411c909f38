use crate::classify::rules::RuleConfig;
use crate::db::{Registry, SqliteRegistry};
use crate::error::{Result, StowageError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use xdg::BaseDirectories;

/// Locations of the Registry database and the optional config file.
pub struct Config {
    pub db_path: PathBuf,
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn new(db_override: Option<PathBuf>) -> Result<Self> {
        let db_path = if let Some(path) = db_override {
            path
        } else if let Ok(env_path) = std::env::var("STOWAGE_DB") {
            PathBuf::from(env_path)
        } else {
            let xdg = BaseDirectories::with_prefix("stowage").map_err(|e| {
                StowageError::Config(format!("Failed to initialize XDG directories: {}", e))
            })?;
            xdg.place_data_file("stowage.db").map_err(|e| {
                StowageError::Config(format!("Failed to create data directory: {}", e))
            })?
        };

        let config_path = BaseDirectories::with_prefix("stowage")
            .ok()
            .and_then(|xdg| xdg.find_config_file("stowage.toml"));

        Ok(Self {
            db_path,
            config_path,
        })
    }

    pub fn ensure_db_directory(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(())
    }

    /// Opens and initializes the Registry at `db_path` with the engine's
    /// busy timeout.
    pub fn open_registry(&self, engine: &EngineConfig) -> Result<SqliteRegistry> {
        self.ensure_db_directory()?;
        let mut registry = SqliteRegistry::open_with_config(&self.db_path, engine)?;
        registry.initialize()?;
        Ok(registry)
    }

    /// Loads the engine configuration from the discovered config file.
    pub fn load_engine_config(&self) -> Result<Option<EngineConfig>> {
        match &self.config_path {
            Some(path) => EngineConfig::from_file(path).map(Some),
            None => Ok(None),
        }
    }
}

/// One ingest tree and the priority its files carry into duplicate
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceTree {
    pub root: PathBuf,
    #[serde(default)]
    pub priority: i64,
}

pub trait SourceTreeProvider {
    fn list_source_trees(&self) -> Vec<SourceTree>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplacementPolicy {
    /// Never move an organized file aside for a higher-priority newcomer
    /// without an explicit reconsolidation.
    #[default]
    Conservative,
    Eager,
}

/// Immutable settings shared by every engine component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub canonical_root: PathBuf,
    pub backup_root: PathBuf,
    #[serde(default = "default_threshold")]
    pub confidence_threshold: f64,
    #[serde(default = "default_token")]
    pub default_token: String,
    #[serde(default = "default_template")]
    pub default_template: String,
    #[serde(default)]
    pub templates: BTreeMap<String, String>,
    #[serde(default)]
    pub source_trees: Vec<SourceTree>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_io_timeout_secs")]
    pub io_timeout_secs: u64,
    #[serde(default = "default_db_busy_timeout_ms")]
    pub db_busy_timeout_ms: u64,
    #[serde(default = "default_sample_bytes")]
    pub quick_sample_bytes: u64,
    #[serde(default)]
    pub displacement_policy: DisplacementPolicy,
    #[serde(default = "default_true")]
    pub enforce_space_limits: bool,
    #[serde(default)]
    pub include_hidden: bool,
    #[serde(default)]
    pub rules: BTreeMap<String, RuleConfig>,
}

fn default_threshold() -> f64 {
    0.70
}

fn default_token() -> String {
    "unknown".to_string()
}

fn default_template() -> String {
    "{category}/{name}".to_string()
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

fn default_io_timeout_secs() -> u64 {
    300
}

fn default_db_busy_timeout_ms() -> u64 {
    5000
}

fn default_sample_bytes() -> u64 {
    crate::index::hasher::DEFAULT_SAMPLE_BYTES
}

fn default_true() -> bool {
    true
}

impl EngineConfig {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(canonical_root: P, backup_root: Q) -> Self {
        Self {
            canonical_root: canonical_root.into(),
            backup_root: backup_root.into(),
            confidence_threshold: default_threshold(),
            default_token: default_token(),
            default_template: default_template(),
            templates: BTreeMap::new(),
            source_trees: Vec::new(),
            concurrency: default_concurrency(),
            io_timeout_secs: default_io_timeout_secs(),
            db_busy_timeout_ms: default_db_busy_timeout_ms(),
            quick_sample_bytes: default_sample_bytes(),
            displacement_policy: DisplacementPolicy::default(),
            enforce_space_limits: true,
            include_hidden: false,
            rules: BTreeMap::new(),
        }
    }

    pub fn with_source_tree<P: Into<PathBuf>>(mut self, root: P, priority: i64) -> Self {
        self.source_trees.push(SourceTree {
            root: root.into(),
            priority,
        });
        self
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(toml_str)
            .map_err(|e| StowageError::Config(format!("Failed to parse TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.confidence_threshold) {
            return Err(StowageError::Config(format!(
                "confidence_threshold must be within [0, 1], got {}",
                self.confidence_threshold
            )));
        }
        if self.concurrency == 0 {
            return Err(StowageError::Config("concurrency must be at least 1".to_string()));
        }
        if self.io_timeout_secs == 0 {
            return Err(StowageError::Config("io_timeout_secs must be at least 1".to_string()));
        }
        if self.canonical_root.as_os_str().is_empty() || self.backup_root.as_os_str().is_empty() {
            return Err(StowageError::Config(
                "canonical_root and backup_root must be set".to_string(),
            ));
        }
        if self.canonical_root.starts_with(&self.backup_root)
            || self.backup_root.starts_with(&self.canonical_root)
        {
            return Err(StowageError::Config(format!(
                "canonical_root {} and backup_root {} must not contain each other",
                self.canonical_root.display(),
                self.backup_root.display()
            )));
        }
        for tree in &self.source_trees {
            if tree.root.as_os_str().is_empty() {
                return Err(StowageError::Config("source tree root is empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn db_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.db_busy_timeout_ms)
    }
}

impl SourceTreeProvider for EngineConfig {
    fn list_source_trees(&self) -> Vec<SourceTree> {
        self.source_trees.clone()
    }
}
