//! End-to-end run: scan, fingerprint, classify, deduplicate, plan, execute.
//!
//! Every phase works from Registry state rather than from the previous
//! phase's in-memory output, so an interrupted run resumes where it stopped
//! and a repeated run over an organized tree changes nothing.

use crate::classify::{seed_rules, Classifier, Dispatcher, FeatureExtractor};
use crate::config::{DisplacementPolicy, EngineConfig, SourceTreeProvider};
use crate::db::{
    CanonicalState, Classification, ClassificationMethod, CorrectionStore, FileRecord, MoveLog,
    Registry, Routing, RuleStore,
};
use crate::error::{Result, StowageError};
use crate::index::dedup::{preferred, DuplicateResolver};
use crate::index::hasher::{full_fingerprint, quick_fingerprint};
use crate::index::scanner::{scan_source_trees, ScanOptions};
use crate::migrate::engine::{ExecutorOptions, MigrationExecutor};
use crate::migrate::planner::Planner;
use crate::migrate::rollback::RollbackEngine;
use crate::migrate::template::{PathTemplates, TemplateResolver};
use crate::migrate::transfer::{LocalTransfer, Transfer};
use crate::util::{format_bytes, format_duration, format_rate};
use rayon::prelude::*;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Shared flag checked between phases and before each move. Moves already in
/// flight run to completion.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Per-phase counts for one run, persisted as the run's JSON summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunSummary {
    pub run_id: i64,
    pub files_scanned: usize,
    pub new_records: usize,
    pub scan_errors: usize,
    pub quick_fingerprinted: usize,
    pub full_fingerprinted: usize,
    pub classified: usize,
    pub quarantined: usize,
    pub degraded: usize,
    pub duplicates_marked: usize,
    pub reconsolidated: usize,
    pub pending_reconsolidations: Vec<String>,
    pub planned: usize,
    pub moved: usize,
    pub move_failures: usize,
    pub bytes_moved: u64,
    pub record_errors: usize,
    pub cancelled: bool,
    pub error: Option<String>,
    pub duration_ms: u64,
}

pub struct Pipeline<'a, R>
where
    R: Registry + MoveLog + RuleStore + CorrectionStore + Send,
{
    registry: &'a mut R,
    config: &'a EngineConfig,
    extractor: Arc<dyn FeatureExtractor>,
    classifier: Arc<dyn Classifier>,
    transfer: Arc<dyn Transfer>,
    templates: Arc<dyn TemplateResolver>,
    cancel: CancellationToken,
    dry_run: bool,
}

impl<'a, R> Pipeline<'a, R>
where
    R: Registry + MoveLog + RuleStore + CorrectionStore + Send,
{
    pub fn new(
        registry: &'a mut R,
        config: &'a EngineConfig,
        extractor: Arc<dyn FeatureExtractor>,
        classifier: Arc<dyn Classifier>,
    ) -> Self {
        Self {
            registry,
            config,
            extractor,
            classifier,
            transfer: Arc::new(LocalTransfer::new(config.io_timeout())),
            templates: Arc::new(PathTemplates::from_config(config)),
            cancel: CancellationToken::new(),
            dry_run: false,
        }
    }

    pub fn with_transfer(mut self, transfer: Arc<dyn Transfer>) -> Self {
        self.transfer = transfer;
        self
    }

    pub fn with_templates(mut self, templates: Arc<dyn TemplateResolver>) -> Self {
        self.templates = templates;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs every phase and records the run. A phase error ends the run early
    /// but the run row is still finished with what was done.
    ///
    /// A dry run works on a snapshot of the Registry and never touches the
    /// filesystem beyond reading it; its summary carries run id 0.
    pub fn run(&mut self) -> Result<RunSummary> {
        if self.dry_run {
            return self.preview();
        }
        self.run_recorded()
    }

    fn preview(&mut self) -> Result<RunSummary> {
        let mut shadow = self.registry.snapshot()?;
        log::info!("Dry run: working on a Registry snapshot");

        let mut summary = Pipeline {
            registry: &mut shadow,
            config: self.config,
            extractor: self.extractor.clone(),
            classifier: self.classifier.clone(),
            transfer: self.transfer.clone(),
            templates: self.templates.clone(),
            cancel: self.cancel.clone(),
            dry_run: true,
        }
        .run_recorded()?;
        summary.run_id = 0;
        Ok(summary)
    }

    fn run_recorded(&mut self) -> Result<RunSummary> {
        let started = Instant::now();
        let run_id = self.registry.start_run()?;
        log::info!("Run {} started", run_id);

        let mut summary = RunSummary {
            run_id,
            ..RunSummary::default()
        };
        let outcome = self.run_phases(run_id, &mut summary);
        if let Err(e) = &outcome {
            log::error!("Run {} stopped: {}", run_id, e);
            summary.error = Some(e.to_string());
        }

        let elapsed = started.elapsed();
        summary.duration_ms = elapsed.as_millis() as u64;
        self.registry
            .finish_run(run_id, &serde_json::to_value(&summary)?)?;

        log::info!(
            "Run {} finished in {}: {} moved ({}, {}), {} failed, {} duplicate(s), {} quarantined",
            run_id,
            format_duration(elapsed),
            summary.moved,
            format_bytes(summary.bytes_moved),
            format_rate(summary.bytes_moved, elapsed),
            summary.move_failures,
            summary.duplicates_marked,
            summary.quarantined
        );

        outcome.map(|()| summary)
    }

    fn run_phases(&mut self, run_id: i64, summary: &mut RunSummary) -> Result<()> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency)
            .build()
            .map_err(|e| StowageError::Config(format!("Cannot build worker pool: {}", e)))?;

        seed_rules(&mut *self.registry, &self.config.rules)?;

        let scan = scan_source_trees(
            &mut *self.registry,
            &self.config.list_source_trees(),
            &ScanOptions::from_config(self.config),
        )?;
        summary.files_scanned = scan.files_scanned;
        summary.new_records = scan.new_records;
        summary.scan_errors = scan.errors;

        if self.stop_requested(summary) {
            return Ok(());
        }
        self.fingerprint_pending(&pool, summary)?;
        self.hash_quick_collisions(&pool, summary)?;

        if self.stop_requested(summary) {
            return Ok(());
        }
        self.classify_pending(&pool, summary)?;

        if self.stop_requested(summary) {
            return Ok(());
        }
        self.deduplicate(summary)?;

        if self.stop_requested(summary) {
            return Ok(());
        }
        self.migrate(&pool, run_id, summary)
    }

    fn stop_requested(&self, summary: &mut RunSummary) -> bool {
        if self.cancel.is_cancelled() {
            log::warn!("Run {} cancelled", summary.run_id);
            summary.cancelled = true;
        }
        summary.cancelled
    }

    fn record_error(&mut self, summary: &mut RunSummary, record: &FileRecord, error: &StowageError) {
        log::warn!(
            "File {} ({}): {}",
            record.id,
            record.current_path.display(),
            error
        );
        summary.record_errors += 1;
        if let Err(e) = self.registry.set_error(record.id, Some(&error.to_string())) {
            log::error!("Could not record error on file {}: {}", record.id, e);
        }
    }

    fn collect_state(&self, state: CanonicalState) -> Result<Vec<FileRecord>> {
        self.registry.list_by_state(state)?.collect()
    }

    fn fingerprint_pending(&mut self, pool: &rayon::ThreadPool, summary: &mut RunSummary) -> Result<()> {
        let pending = self.collect_state(CanonicalState::Pending)?;
        if pending.is_empty() {
            return Ok(());
        }

        let sample = self.config.quick_sample_bytes;
        let cancel = self.cancel.clone();
        let results: Vec<Result<String>> = pool.install(|| {
            pending
                .par_iter()
                .map(|record| {
                    if cancel.is_cancelled() {
                        return Err(StowageError::Cancelled);
                    }
                    quick_fingerprint(&record.current_path, sample)
                })
                .collect()
        });

        for (record, result) in pending.iter().zip(results) {
            match result {
                Ok(quick) => match self.registry.update_fingerprints(record.id, &quick, None) {
                    Ok(_) => summary.quick_fingerprinted += 1,
                    Err(e) => self.record_error(summary, record, &e),
                },
                Err(StowageError::Cancelled) => {}
                Err(e) => self.record_error(summary, record, &e),
            }
        }

        log::info!("Quick-fingerprinted {} file(s)", summary.quick_fingerprinted);
        Ok(())
    }

    /// Full-hashes records whose quick fingerprint is shared with another
    /// record. Records with a unique quick fingerprint cannot share content
    /// with anything tracked, so they are left until they are moved.
    fn hash_quick_collisions(&mut self, pool: &rayon::ThreadPool, summary: &mut RunSummary) -> Result<()> {
        let mut targets = Vec::new();
        for quick in self.registry.colliding_quick_fingerprints()? {
            targets.extend(
                self.registry
                    .find_by_quick_fingerprint(&quick)?
                    .into_iter()
                    .filter(|r| r.full_fingerprint.is_none() && r.state != CanonicalState::Pending),
            );
        }
        self.full_hash(pool, targets, summary)
    }

    fn full_hash(
        &mut self,
        pool: &rayon::ThreadPool,
        targets: Vec<FileRecord>,
        summary: &mut RunSummary,
    ) -> Result<()> {
        if targets.is_empty() {
            return Ok(());
        }

        let results: Vec<Result<String>> = pool.install(|| {
            targets
                .par_iter()
                .map(|record| full_fingerprint(&record.current_path))
                .collect()
        });

        for (record, result) in targets.iter().zip(results) {
            match result.and_then(|full| self.registry.set_full_fingerprint(record.id, &full)) {
                Ok(()) => summary.full_fingerprinted += 1,
                Err(e) => self.record_error(summary, record, &e),
            }
        }
        Ok(())
    }

    fn classify_pending(&mut self, pool: &rayon::ThreadPool, summary: &mut RunSummary) -> Result<()> {
        let unclassified: Vec<FileRecord> = self
            .collect_state(CanonicalState::Registered)?
            .into_iter()
            .filter(|r| r.category.is_none())
            .collect();
        if unclassified.is_empty() {
            return Ok(());
        }

        let mut corrections = Vec::with_capacity(unclassified.len());
        for record in &unclassified {
            corrections.push(self.registry.latest_correction(record.id)?);
        }

        let dispatcher = Dispatcher::from_store(
            &*self.registry,
            self.config,
            self.extractor.clone(),
            self.classifier.clone(),
        )?;
        let results: Vec<Classification> = pool.install(|| {
            unclassified
                .par_iter()
                .zip(corrections.par_iter())
                .map(|(record, correction)| dispatcher.classify(record, correction.as_ref()))
                .collect()
        });

        for (record, classification) in unclassified.iter().zip(results) {
            match self.registry.record_classification(record.id, &classification) {
                Ok(_) => {
                    summary.classified += 1;
                    if classification.routing == Routing::Quarantine {
                        summary.quarantined += 1;
                    }
                    if classification.degraded.is_some() {
                        summary.degraded += 1;
                    }
                }
                Err(e) => self.record_error(summary, record, &e),
            }
        }

        log::info!(
            "Classified {} file(s), {} quarantined",
            summary.classified,
            summary.quarantined
        );
        Ok(())
    }

    fn deduplicate(&mut self, summary: &mut RunSummary) -> Result<()> {
        let resolver = DuplicateResolver::new(self.config.displacement_policy);
        let stats = resolver.resolve_all(&mut *self.registry)?;
        summary.duplicates_marked = stats.duplicates_marked;

        match self.config.displacement_policy {
            DisplacementPolicy::Conservative => {
                summary.pending_reconsolidations = stats.pending_reconsolidations;
            }
            DisplacementPolicy::Eager => {
                for fingerprint in stats.pending_reconsolidations {
                    match self.reconsolidate(&fingerprint) {
                        Ok(Some(_)) => summary.reconsolidated += 1,
                        Ok(None) => {}
                        Err(e) => {
                            log::error!("Reconsolidation of {} failed: {}", fingerprint, e);
                            summary.pending_reconsolidations.push(fingerprint);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn migrate(&mut self, pool: &rayon::ThreadPool, run_id: i64, summary: &mut RunSummary) -> Result<()> {
        let movable: Vec<FileRecord> = self
            .collect_state(CanonicalState::Registered)?
            .into_iter()
            .filter(|r| r.category.is_some())
            .collect();
        if movable.is_empty() {
            return Ok(());
        }

        let unhashed: Vec<FileRecord> = movable
            .iter()
            .filter(|r| r.full_fingerprint.is_none())
            .cloned()
            .collect();
        self.full_hash(pool, unhashed, summary)?;

        let mut records = Vec::with_capacity(movable.len());
        for record in &movable {
            if let Some(current) = self.registry.get_file(record.id)? {
                records.push(current);
            }
        }

        let (plans, failures) = Planner::new(self.templates.as_ref()).plan(&records);
        for (file_id, error) in &failures {
            if let Some(record) = records.iter().find(|r| r.id == *file_id) {
                self.record_error(summary, record, error);
            }
        }
        summary.planned = plans.len();

        let report = MigrationExecutor::new(
            &mut *self.registry,
            self.config,
            self.transfer.clone(),
            ExecutorOptions {
                dry_run: self.dry_run,
                run_id: Some(run_id),
            },
        )
        .with_cancellation(self.cancel.clone())
        .execute(plans)?;

        summary.moved = report.moved;
        summary.move_failures = report.failed;
        summary.bytes_moved = report.bytes_moved;
        summary.cancelled |= report.cancelled;
        Ok(())
    }

    /// Records a manual correction and reclassifies the file with it. A
    /// quarantined file becomes `registered` and is moved on the next run. An
    /// organized file keeps its place; only its category changes.
    pub fn apply_correction(
        &mut self,
        file_id: i64,
        category: &str,
        corrected_by: &str,
    ) -> Result<Classification> {
        let record = self
            .registry
            .get_file(file_id)?
            .ok_or(StowageError::RecordNotFound(file_id))?;
        if record.state == CanonicalState::Pending {
            return Err(StowageError::InvalidStateTransition {
                from: record.state.as_str().to_string(),
                to: CanonicalState::Registered.as_str().to_string(),
            });
        }

        let correction = self
            .registry
            .record_correction(file_id, category, corrected_by)?;
        let dispatcher = Dispatcher::from_store(
            &*self.registry,
            self.config,
            self.extractor.clone(),
            self.classifier.clone(),
        )?;
        let classification = dispatcher.classify(&record, Some(&correction));
        self.registry.record_classification(file_id, &classification)?;

        log::info!(
            "File {} corrected to {} by {}",
            file_id,
            category,
            corrected_by
        );
        Ok(classification)
    }

    /// Replaces the organized copy of `fingerprint` with the best-ranked
    /// record when that record has strictly higher source priority. The old
    /// copy is rolled back and becomes a duplicate; the new one is organized
    /// by the next migration. Returns the id of the newly retained record.
    pub fn reconsolidate(&mut self, fingerprint: &str) -> Result<Option<i64>> {
        let candidates: Vec<FileRecord> = self
            .registry
            .find_by_full_fingerprint(fingerprint)?
            .into_iter()
            .filter(|r| !matches!(r.state, CanonicalState::Pending | CanonicalState::Quarantined))
            .collect();

        let Some(organized) = candidates
            .iter()
            .find(|r| r.state == CanonicalState::Organized)
            .cloned()
        else {
            return Ok(None);
        };
        let Some(ideal) = preferred(&candidates).cloned() else {
            return Ok(None);
        };
        if ideal.id == organized.id || ideal.source_priority <= organized.source_priority {
            return Ok(None);
        }

        log::info!(
            "Reconsolidating {}: file {} replaces organized file {}",
            fingerprint,
            ideal.id,
            organized.id
        );

        RollbackEngine::new(&mut *self.registry, self.transfer.clone()).rollback_file(organized.id)?;

        if ideal.state == CanonicalState::Duplicate {
            self.registry
                .promote_duplicate(ideal.id, &format!("reconsolidation of {}", fingerprint))?;
        }
        self.registry.mark_duplicate(organized.id, ideal.id)?;

        if let Some(category) = organized.category.clone() {
            let inherited = Classification {
                category,
                entity: organized.entity.clone(),
                confidence: organized.confidence.unwrap_or(1.0),
                method: organized.method.unwrap_or(ClassificationMethod::Manual),
                rule_id: None,
                rule_name: None,
                degraded: None,
                routing: Routing::Organize,
            };
            self.registry.record_classification(ideal.id, &inherited)?;
        }

        Ok(Some(ideal.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::{MetadataExtractor, NoModel, RuleConfig};
    use crate::db::SqliteRegistry;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn config_for(temp_dir: &TempDir) -> EngineConfig {
        let mut config = EngineConfig::new(temp_dir.path().join("canon"), temp_dir.path().join("bak"))
            .with_source_tree(temp_dir.path().join("laptop"), 100)
            .with_source_tree(temp_dir.path().join("phone"), 50);
        config.concurrency = 2;
        config.rules.insert(
            "text".to_string(),
            RuleConfig {
                pattern: "*.txt".to_string(),
                category: "notes".to_string(),
                rule_priority: 50,
            },
        );
        config
    }

    fn write(root: &Path, name: &str, content: &[u8]) {
        let path = root.join(name);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn pipeline<'a>(registry: &'a mut SqliteRegistry, config: &'a EngineConfig) -> Pipeline<'a, SqliteRegistry> {
        Pipeline::new(
            registry,
            config,
            Arc::new(MetadataExtractor),
            Arc::new(NoModel),
        )
    }

    #[test]
    fn test_cancellation_token() {
        let token = CancellationToken::new();
        let shared = token.clone();
        assert!(!shared.is_cancelled());
        token.cancel();
        assert!(shared.is_cancelled());
    }

    #[test]
    fn test_run_organizes_and_quarantines() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_for(&temp_dir);
        write(&temp_dir.path().join("laptop"), "todo.txt", b"buy milk");
        write(&temp_dir.path().join("phone"), "blob.bin", b"\x00\x01");

        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        let summary = pipeline(&mut registry, &config).run().unwrap();

        assert_eq!(summary.files_scanned, 2);
        assert_eq!(summary.classified, 2);
        assert_eq!(summary.quarantined, 1);
        assert_eq!(summary.moved, 1);
        assert!(config.canonical_root.join("notes/todo.txt").exists());
        assert!(temp_dir.path().join("phone/blob.bin").exists());

        let runs = registry.list_runs().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].summary.as_ref().unwrap()["moved"], 1);
    }

    #[test]
    fn test_cancelled_run_is_still_recorded() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_for(&temp_dir);
        write(&temp_dir.path().join("laptop"), "todo.txt", b"buy milk");

        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let summary = pipeline(&mut registry, &config)
            .with_cancellation(token)
            .run()
            .unwrap();

        assert!(summary.cancelled);
        assert_eq!(summary.moved, 0);
        assert!(registry.list_runs().unwrap()[0].finished_at.is_some());
    }

    #[test]
    fn test_correction_releases_quarantined_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = config_for(&temp_dir);
        write(&temp_dir.path().join("phone"), "scan.bin", b"\x00\x01\x02");

        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        pipeline(&mut registry, &config).run().unwrap();

        let record = registry
            .get_file_by_path(&temp_dir.path().join("phone/scan.bin"))
            .unwrap()
            .unwrap();
        assert_eq!(record.state, CanonicalState::Quarantined);

        let classification = pipeline(&mut registry, &config)
            .apply_correction(record.id, "receipts", "reviewer")
            .unwrap();
        assert_eq!(classification.method, ClassificationMethod::Manual);
        assert_eq!(
            registry.get_file(record.id).unwrap().unwrap().state,
            CanonicalState::Registered
        );

        let summary = pipeline(&mut registry, &config).run().unwrap();
        assert_eq!(summary.moved, 1);
        assert!(config.canonical_root.join("receipts/scan.bin").exists());
    }

    #[test]
    fn test_eager_policy_reconsolidates_higher_priority_copy() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = config_for(&temp_dir);
        config.displacement_policy = DisplacementPolicy::Eager;
        write(&temp_dir.path().join("phone"), "a.txt", b"same bytes");

        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        pipeline(&mut registry, &config).run().unwrap();
        let phone = registry
            .get_file_by_path(&temp_dir.path().join("phone/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(phone.state, CanonicalState::Organized);

        write(&temp_dir.path().join("laptop"), "a.txt", b"same bytes");
        let summary = pipeline(&mut registry, &config).run().unwrap();
        assert_eq!(summary.reconsolidated, 1);

        let laptop = registry
            .get_file_by_path(&temp_dir.path().join("laptop/a.txt"))
            .unwrap()
            .unwrap();
        assert_eq!(laptop.state, CanonicalState::Organized);
        let phone = registry.get_file(phone.id).unwrap().unwrap();
        assert_eq!(phone.state, CanonicalState::Duplicate);
        assert!(temp_dir.path().join("phone/a.txt").exists());
        assert!(!temp_dir.path().join("laptop/a.txt").exists());
        assert_eq!(registry.duplicate_links_for(laptop.id).unwrap().len(), 1);
    }
}
