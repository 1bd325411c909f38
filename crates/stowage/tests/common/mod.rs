#![allow(dead_code)]

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use stowage::classify::{Classifier, FeatureExtractor, FeatureSet, MetadataExtractor, Prediction};
use stowage::migrate::{LocalTransfer, Transfer};
use stowage::{EngineConfig, Pipeline, Registry, Result, SqliteRegistry, StowageError};
use tempfile::TempDir;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub struct TestFixture {
    pub temp_dir: TempDir,
    pub db_path: PathBuf,
    pub config: EngineConfig,
    pub registry: SqliteRegistry,
}

impl TestFixture {
    /// File-backed registry plus two source trees: `laptop` (priority 100)
    /// and `phone` (priority 50).
    pub fn new() -> Result<Self> {
        init_logging();
        let temp_dir = tempfile::tempdir()?;
        let db_path = temp_dir.path().join("registry.db");
        let mut config = EngineConfig::new(temp_dir.path().join("canon"), temp_dir.path().join("backup"))
            .with_source_tree(temp_dir.path().join("laptop"), 100)
            .with_source_tree(temp_dir.path().join("phone"), 50);
        config.concurrency = 2;

        let mut registry = SqliteRegistry::open_with_config(&db_path, &config)?;
        registry.initialize()?;

        Ok(Self {
            temp_dir,
            db_path,
            config,
            registry,
        })
    }

    pub fn root(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn laptop(&self, name: &str) -> PathBuf {
        self.root().join("laptop").join(name)
    }

    pub fn phone(&self, name: &str) -> PathBuf {
        self.root().join("phone").join(name)
    }

    pub fn pipeline_with(
        &mut self,
        extractor: Arc<dyn FeatureExtractor>,
        classifier: Arc<dyn Classifier>,
    ) -> Pipeline<'_, SqliteRegistry> {
        Pipeline::new(&mut self.registry, &self.config, extractor, classifier)
    }

    /// Pipeline whose model files everything under `category` at
    /// `confidence`.
    pub fn pipeline(&mut self, category: &str, confidence: f64) -> Pipeline<'_, SqliteRegistry> {
        self.pipeline_with(
            Arc::new(MetadataExtractor),
            Arc::new(FixedModel::new(category, confidence)),
        )
    }
}

pub fn write_file(path: &Path, content: &[u8]) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

pub struct FixedModel {
    category: String,
    confidence: f64,
}

impl FixedModel {
    pub fn new(category: &str, confidence: f64) -> Self {
        Self {
            category: category.to_string(),
            confidence,
        }
    }
}

impl Classifier for FixedModel {
    fn classify(&self, _features: &FeatureSet) -> Result<Prediction> {
        Ok(Prediction {
            category: self.category.clone(),
            confidence: self.confidence,
            entity: None,
        })
    }
}

pub struct UnsupportedExtractor;

impl FeatureExtractor for UnsupportedExtractor {
    fn extract_features(&self, path: &Path) -> Result<FeatureSet> {
        Err(StowageError::UnsupportedFormat(path.display().to_string()))
    }
}

/// Copies a flipped first byte so backups never verify.
pub struct CorruptingTransfer {
    inner: LocalTransfer,
}

impl CorruptingTransfer {
    pub fn new() -> Self {
        Self {
            inner: LocalTransfer::default(),
        }
    }
}

impl Transfer for CorruptingTransfer {
    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        let mut bytes = fs::read(from)?;
        if let Some(first) = bytes.first_mut() {
            *first ^= 0xff;
        } else {
            bytes.push(0);
        }
        fs::create_dir_all(to.parent().unwrap())?;
        fs::write(to, &bytes)?;
        Ok(bytes.len() as u64)
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        self.inner.rename(from, to)
    }
}

/// Copies normally but refuses every rename.
pub struct StuckRenameTransfer {
    inner: LocalTransfer,
}

impl StuckRenameTransfer {
    pub fn new() -> Self {
        Self {
            inner: LocalTransfer::default(),
        }
    }
}

impl Transfer for StuckRenameTransfer {
    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        self.inner.copy(from, to)
    }

    fn rename(&self, _from: &Path, _to: &Path) -> Result<()> {
        Err(StowageError::Io(io::Error::new(
            io::ErrorKind::PermissionDenied,
            "read-only destination",
        )))
    }
}

/// Every copy stalls past its deadline.
pub struct StalledTransfer;

impl Transfer for StalledTransfer {
    fn copy(&self, from: &Path, to: &Path) -> Result<u64> {
        Err(StowageError::Timeout {
            operation: format!("copy {} -> {}", from.display(), to.display()),
            seconds: 0,
        })
    }

    fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        LocalTransfer::default().rename(from, to)
    }
}
