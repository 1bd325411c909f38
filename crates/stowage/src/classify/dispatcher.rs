//! Two-pass classification as a chain of matchers.
//!
//! Pattern rules are tried in descending priority; the first hit is
//! authoritative. The model matcher closes the chain and always answers,
//! degrading to `general_document` at confidence 0 when extraction or the
//! model fails. The dispatcher then applies the confidence gate.

use crate::classify::rules::{compile_active_rules, PatternRule};
use crate::classify::{Classifier, FeatureExtractor};
use crate::config::EngineConfig;
use crate::db::{
    Classification, ClassificationMethod, FileRecord, ManualCorrection, RuleKind, RuleStore,
    Routing, StoredRule,
};
use crate::error::{Result, StowageError};
use std::sync::Arc;

pub const GENERAL_DOCUMENT: &str = "general_document";

/// One link in the classification chain. Returning `None` passes the record
/// to the next matcher.
pub trait Matcher: Send + Sync {
    fn name(&self) -> &str;
    fn try_match(&self, record: &FileRecord) -> Option<Classification>;
}

pub struct PatternMatcher {
    rule: PatternRule,
}

impl PatternMatcher {
    pub fn new(rule: PatternRule) -> Self {
        Self { rule }
    }
}

impl Matcher for PatternMatcher {
    fn name(&self) -> &str {
        &self.rule.rule.name
    }

    fn try_match(&self, record: &FileRecord) -> Option<Classification> {
        if !self.rule.matches(record) {
            return None;
        }
        Some(Classification {
            category: self.rule.category.clone(),
            entity: None,
            confidence: 1.0,
            method: ClassificationMethod::Pattern,
            rule_id: Some(self.rule.rule.id),
            rule_name: Some(self.rule.rule.name.clone()),
            degraded: None,
            routing: Routing::Organize,
        })
    }
}

pub struct ModelMatcher {
    extractor: Arc<dyn FeatureExtractor>,
    classifier: Arc<dyn Classifier>,
    rule: Option<StoredRule>,
}

impl ModelMatcher {
    pub fn new(
        extractor: Arc<dyn FeatureExtractor>,
        classifier: Arc<dyn Classifier>,
        rule: Option<StoredRule>,
    ) -> Self {
        Self {
            extractor,
            classifier,
            rule,
        }
    }

    fn predict(&self, record: &FileRecord) -> Result<(String, f64, Option<String>)> {
        let features = self.extractor.extract_features(&record.current_path)?;
        let prediction = self.classifier.classify(&features)?;

        let category = prediction.category.trim();
        if category.is_empty() {
            return Err(StowageError::Model("empty category".to_string()));
        }
        Ok((
            category.to_string(),
            sanitize_confidence(prediction.confidence),
            prediction.entity,
        ))
    }
}

impl Matcher for ModelMatcher {
    fn name(&self) -> &str {
        "model"
    }

    fn try_match(&self, record: &FileRecord) -> Option<Classification> {
        let base = Classification {
            category: GENERAL_DOCUMENT.to_string(),
            entity: None,
            confidence: 0.0,
            method: ClassificationMethod::Model,
            rule_id: self.rule.as_ref().map(|r| r.id),
            rule_name: self.rule.as_ref().map(|r| r.name.clone()),
            degraded: None,
            routing: Routing::Quarantine,
        };

        match self.predict(record) {
            Ok((category, confidence, entity)) => Some(Classification {
                category,
                confidence,
                entity,
                ..base
            }),
            Err(e) => {
                let degraded = StowageError::ClassificationDegraded(e.to_string());
                log::warn!(
                    "File {} ({}): {}",
                    record.id,
                    record.current_path.display(),
                    degraded
                );
                Some(Classification {
                    degraded: Some(degraded.to_string()),
                    ..base
                })
            }
        }
    }
}

fn sanitize_confidence(confidence: f64) -> f64 {
    if confidence.is_nan() {
        0.0
    } else {
        confidence.clamp(0.0, 1.0)
    }
}

pub struct Dispatcher {
    chain: Vec<Box<dyn Matcher>>,
    threshold: f64,
}

impl Dispatcher {
    /// Builds the chain from the Registry's active rules.
    pub fn from_store<S: RuleStore + ?Sized>(
        store: &S,
        config: &EngineConfig,
        extractor: Arc<dyn FeatureExtractor>,
        classifier: Arc<dyn Classifier>,
    ) -> Result<Self> {
        Ok(Self::new(store.active_rules()?, config, extractor, classifier))
    }

    pub fn new(
        rules: Vec<StoredRule>,
        config: &EngineConfig,
        extractor: Arc<dyn FeatureExtractor>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        let model_rule = rules.iter().find(|r| r.kind == RuleKind::Model).cloned();

        let mut chain: Vec<Box<dyn Matcher>> = compile_active_rules(rules)
            .into_iter()
            .map(|rule| Box::new(PatternMatcher::new(rule)) as Box<dyn Matcher>)
            .collect();
        chain.push(Box::new(ModelMatcher::new(extractor, classifier, model_rule)));

        log::debug!("Classification chain has {} matcher(s)", chain.len());
        Self {
            chain,
            threshold: config.confidence_threshold,
        }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Classifies one record. Never fails: every error inside the chain
    /// degrades to a quarantined `general_document`.
    ///
    /// A manual correction overrides the chain with the corrected category at
    /// full confidence.
    pub fn classify(
        &self,
        record: &FileRecord,
        correction: Option<&ManualCorrection>,
    ) -> Classification {
        if let Some(correction) = correction {
            return Classification {
                category: correction.corrected_category.clone(),
                entity: record.entity.clone(),
                confidence: 1.0,
                method: ClassificationMethod::Manual,
                rule_id: None,
                rule_name: None,
                degraded: None,
                routing: Routing::Organize,
            };
        }

        let mut classification = self
            .chain
            .iter()
            .find_map(|matcher| {
                let result = matcher.try_match(record);
                if result.is_some() {
                    log::debug!("File {} matched by {}", record.id, matcher.name());
                }
                result
            })
            .unwrap_or_else(|| Classification {
                category: GENERAL_DOCUMENT.to_string(),
                entity: None,
                confidence: 0.0,
                method: ClassificationMethod::Model,
                rule_id: None,
                rule_name: None,
                degraded: Some("no matcher answered".to_string()),
                routing: Routing::Quarantine,
            });

        classification.routing = if classification.confidence >= self.threshold {
            Routing::Organize
        } else {
            Routing::Quarantine
        };
        classification
    }
}
