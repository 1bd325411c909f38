use crate::config::EngineConfig;
use crate::db::{CanonicalState, MoveLog, MoveOutcome, MoveRecord, NewMove, Registry, StateTransition};
use crate::error::{Result, StowageError};
use crate::index::hasher::{full_fingerprint, verify_fingerprint};
use crate::migrate::planner::{disambiguate, total_bytes, MovePlan};
use crate::migrate::space;
use crate::migrate::transfer::Transfer;
use crate::pipeline::CancellationToken;
use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, Default)]
pub struct ExecutorOptions {
    pub dry_run: bool,
    pub run_id: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MoveFailure {
    pub file_id: i64,
    pub path: PathBuf,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    pub moved: usize,
    pub failed: usize,
    pub skipped: usize,
    pub bytes_moved: u64,
    pub cancelled: bool,
    pub failures: Vec<MoveFailure>,
    /// Every move row appended by this batch, successful or failed.
    pub records: Vec<MoveRecord>,
}

enum Outcome {
    Moved(MoveRecord, u64),
    Failed(MoveFailure, Option<MoveRecord>),
    Skipped,
    Cancelled,
}

pub struct MigrationExecutor<'a, R: Registry + MoveLog + Send> {
    registry: &'a mut R,
    config: &'a EngineConfig,
    transfer: Arc<dyn Transfer>,
    options: ExecutorOptions,
    cancel: Option<CancellationToken>,
}

impl<'a, R: Registry + MoveLog + Send> MigrationExecutor<'a, R> {
    pub fn new(
        registry: &'a mut R,
        config: &'a EngineConfig,
        transfer: Arc<dyn Transfer>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            registry,
            config,
            transfer,
            options,
            cancel: None,
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Executes `plans`. Moves into the same directory run one after another;
    /// different directories run concurrently on the worker pool.
    pub fn execute(&mut self, plans: Vec<MovePlan>) -> Result<ExecutionReport> {
        let mut report = ExecutionReport::default();
        if plans.is_empty() {
            return Ok(report);
        }

        if self.options.dry_run {
            for plan in &plans {
                log::info!(
                    "DRY RUN: would move {} -> {}",
                    plan.source.display(),
                    plan.destination.display()
                );
            }
            report.skipped = plans.len();
            return Ok(report);
        }

        if self.config.enforce_space_limits {
            let required = total_bytes(&plans);
            space::verify_sufficient_space(
                &[self.config.backup_root.as_path(), self.config.canonical_root.as_path()],
                required,
            )?;
        }

        let groups = group_by_directory(plans);
        log::info!(
            "Executing {} destination group(s) on {} worker(s)",
            groups.len(),
            self.config.concurrency
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.concurrency)
            .build()
            .map_err(|e| StowageError::Config(format!("Cannot build worker pool: {}", e)))?;

        let registry = Mutex::new(&mut *self.registry);
        let worker = MoveWorker {
            registry: &registry,
            config: self.config,
            transfer: self.transfer.as_ref(),
            run_id: self.options.run_id,
            cancel: self.cancel.as_ref(),
        };

        let outcomes: Vec<Vec<Outcome>> = pool.install(|| {
            groups
                .par_iter()
                .map(|group| group.iter().map(|plan| worker.execute_one(plan)).collect())
                .collect()
        });

        for outcome in outcomes.into_iter().flatten() {
            match outcome {
                Outcome::Moved(record, bytes) => {
                    report.moved += 1;
                    report.bytes_moved += bytes;
                    report.records.push(record);
                }
                Outcome::Failed(failure, record) => {
                    report.failed += 1;
                    report.failures.push(failure);
                    report.records.extend(record);
                }
                Outcome::Skipped => report.skipped += 1,
                Outcome::Cancelled => {
                    report.skipped += 1;
                    report.cancelled = true;
                }
            }
        }

        log::info!(
            "Migration finished: {} moved, {} failed, {} skipped",
            report.moved,
            report.failed,
            report.skipped
        );
        Ok(report)
    }
}

fn group_by_directory(plans: Vec<MovePlan>) -> Vec<Vec<MovePlan>> {
    let mut groups: BTreeMap<PathBuf, Vec<MovePlan>> = BTreeMap::new();
    for plan in plans {
        let dir = plan
            .destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        groups.entry(dir).or_default().push(plan);
    }
    groups.into_values().collect()
}

/// Backup location for one move: `<backup_root>/<timestamp>-<file id>/<name>`.
pub fn backup_path_for(backup_root: &Path, plan: &MovePlan) -> PathBuf {
    let name = plan
        .source
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("file-{}", plan.file_id));
    backup_root
        .join(format!(
            "{}-{}",
            Utc::now().format("%Y%m%dT%H%M%S%.6fZ"),
            plan.file_id
        ))
        .join(name)
}

struct MoveWorker<'w, 'r, R> {
    registry: &'w Mutex<&'r mut R>,
    config: &'w EngineConfig,
    transfer: &'w dyn Transfer,
    run_id: Option<i64>,
    cancel: Option<&'w CancellationToken>,
}

impl<'w, 'r, R: Registry + MoveLog + Send> MoveWorker<'w, 'r, R> {
    fn lock(&self) -> MutexGuard<'w, &'r mut R> {
        self.registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn execute_one(&self, plan: &MovePlan) -> Outcome {
        if self.cancel.is_some_and(|c| c.is_cancelled()) {
            log::info!("Cancelled before moving file {}", plan.file_id);
            return Outcome::Cancelled;
        }

        // The guard must drop before `fail` locks again.
        let lookup = self.lock().get_file(plan.file_id);
        let state = match lookup {
            Ok(Some(record)) => record.state,
            Ok(None) => {
                let err = StowageError::RecordNotFound(plan.file_id);
                return self.fail(plan, &plan.destination, None, err);
            }
            Err(e) => return self.fail(plan, &plan.destination, None, e),
        };
        if state != CanonicalState::Registered {
            log::debug!("File {} is {}, not moving", plan.file_id, state.as_str());
            return Outcome::Skipped;
        }

        if let Err(e) = verify_fingerprint(&plan.source, &plan.full_fingerprint) {
            return self.fail(plan, &plan.destination, None, e);
        }

        let backup = backup_path_for(&self.config.backup_root, plan);
        if let Err(e) = self.transfer.copy(&plan.source, &backup) {
            return self.fail(plan, &plan.destination, None, e);
        }
        match full_fingerprint(&backup) {
            Ok(actual) if actual == plan.full_fingerprint => {}
            Ok(actual) => {
                let err = StowageError::BackupVerificationFailed {
                    path: backup.clone(),
                    expected: plan.full_fingerprint.clone(),
                    actual,
                };
                return self.fail(plan, &plan.destination, Some(backup), err);
            }
            Err(e) => return self.fail(plan, &plan.destination, Some(backup), e),
        }

        let destination = disambiguate(&plan.destination, &plan.short_id, |p| p.exists());
        if let Err(e) = self.transfer.rename(&plan.source, &destination) {
            let err = StowageError::MoveFailed {
                path: plan.source.clone(),
                reason: e.to_string(),
            };
            return self.fail(plan, &destination, Some(backup), err);
        }

        let entry = NewMove {
            file_id: plan.file_id,
            run_id: self.run_id,
            original_path: plan.source.clone(),
            destination_path: destination.clone(),
            backup_path: Some(backup.clone()),
            outcome: MoveOutcome::Success,
            reverts: None,
            error: None,
        };
        let transition = StateTransition {
            to: CanonicalState::Organized,
            current_path: destination.clone(),
            full_fingerprint: Some(plan.full_fingerprint.clone()),
        };

        let committed = self.lock().record_move(&entry, Some(&transition));
        match committed {
            Ok(record) => {
                log::info!(
                    "Moved file {}: {} -> {}",
                    plan.file_id,
                    plan.source.display(),
                    destination.display()
                );
                Outcome::Moved(record, plan.size_bytes)
            }
            Err(e) => {
                log::error!("Commit failed for file {}, moving it back: {}", plan.file_id, e);
                if let Err(undo) = self.transfer.rename(&destination, &plan.source) {
                    log::error!(
                        "Could not return {} to {}: {}; backup kept at {}",
                        destination.display(),
                        plan.source.display(),
                        undo,
                        backup.display()
                    );
                }
                self.fail(plan, &destination, Some(backup), e)
            }
        }
    }

    /// Appends a failed move row and records the error on the file. State is
    /// left unchanged.
    fn fail(
        &self,
        plan: &MovePlan,
        destination: &Path,
        backup: Option<PathBuf>,
        error: StowageError,
    ) -> Outcome {
        let message = error.to_string();
        log::warn!(
            "Move of file {} ({}) failed: {}",
            plan.file_id,
            plan.source.display(),
            message
        );

        let entry = NewMove {
            file_id: plan.file_id,
            run_id: self.run_id,
            original_path: plan.source.clone(),
            destination_path: destination.to_path_buf(),
            backup_path: backup,
            outcome: MoveOutcome::Failed,
            reverts: None,
            error: Some(message.clone()),
        };

        let mut registry = self.lock();
        let record = match registry.record_move(&entry, None) {
            Ok(record) => Some(record),
            Err(e) => {
                log::error!("Could not record failed move of file {}: {}", plan.file_id, e);
                None
            }
        };
        if let Err(e) = registry.set_error(plan.file_id, Some(&message)) {
            log::error!("Could not record error on file {}: {}", plan.file_id, e);
        }

        Outcome::Failed(
            MoveFailure {
                file_id: plan.file_id,
                path: plan.source.clone(),
                error: message,
            },
            record,
        )
    }
}
