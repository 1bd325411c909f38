pub mod dispatcher;
pub mod rules;

use crate::error::{Result, StowageError};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use dispatcher::{Dispatcher, Matcher, ModelMatcher, PatternMatcher, GENERAL_DOCUMENT};
pub use rules::{seed_rules, RuleConfig};

/// Classifier inputs extracted from a file. Opaque to the engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureSet {
    pub path: PathBuf,
    pub fields: BTreeMap<String, String>,
}

/// What the model collaborator returns for one feature set.
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub category: String,
    pub confidence: f64,
    pub entity: Option<String>,
}

pub trait FeatureExtractor: Send + Sync {
    /// Deterministic for identical content. Fails with `UnsupportedFormat`
    /// for files it cannot read.
    fn extract_features(&self, path: &Path) -> Result<FeatureSet>;
}

pub trait Classifier: Send + Sync {
    fn classify(&self, features: &FeatureSet) -> Result<Prediction>;
}

/// Extracts file-system metadata only: name, extension and size.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetadataExtractor;

impl FeatureExtractor for MetadataExtractor {
    fn extract_features(&self, path: &Path) -> Result<FeatureSet> {
        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StowageError::FileNotFound(path.to_path_buf())
            } else {
                StowageError::Io(e)
            }
        })?;
        if !metadata.is_file() {
            return Err(StowageError::UnsupportedFormat(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let mut fields = BTreeMap::new();
        if let Some(name) = path.file_name() {
            fields.insert("name".to_string(), name.to_string_lossy().to_string());
        }
        if let Some(ext) = path.extension() {
            fields.insert("extension".to_string(), ext.to_string_lossy().to_lowercase());
        }
        fields.insert("size".to_string(), metadata.len().to_string());

        Ok(FeatureSet {
            path: path.to_path_buf(),
            fields,
        })
    }
}

/// Stand-in used when no trained model is wired in. Every call fails, which
/// the dispatcher turns into a quarantined `general_document`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoModel;

impl Classifier for NoModel {
    fn classify(&self, _features: &FeatureSet) -> Result<Prediction> {
        Err(StowageError::Model("no classifier configured".to_string()))
    }
}
