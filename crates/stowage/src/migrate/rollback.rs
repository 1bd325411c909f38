use crate::db::{
    CanonicalState, MoveLog, MoveOutcome, MoveRecord, NewMove, Registry, StateTransition,
};
use crate::error::{Result, StowageError};
use crate::index::hasher::{fingerprint_matches, full_fingerprint};
use crate::migrate::transfer::Transfer;
use serde::Serialize;
use std::fs;
use std::sync::Arc;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RollbackReport {
    pub rolled_back: Vec<i64>,
    pub failures: Vec<(i64, String)>,
}

pub struct RollbackEngine<'a, R: Registry + MoveLog> {
    registry: &'a mut R,
    transfer: Arc<dyn Transfer>,
}

impl<'a, R: Registry + MoveLog> RollbackEngine<'a, R> {
    pub fn new(registry: &'a mut R, transfer: Arc<dyn Transfer>) -> Self {
        Self { registry, transfer }
    }

    /// Restores the original file of a successful move from its backup and
    /// returns the appended `rolled_back` row.
    ///
    /// The Registry commit happens before the organized copy is removed, so a
    /// crash in between leaves an extra file on disk rather than a record that
    /// points at nothing.
    pub fn rollback_move(&mut self, move_id: i64) -> Result<MoveRecord> {
        let entry = self
            .registry
            .get_move(move_id)?
            .ok_or(StowageError::MoveNotFound(move_id))?;

        if entry.outcome != MoveOutcome::Success {
            return Err(StowageError::RollbackRefused(format!(
                "move {} has outcome {}",
                move_id,
                entry.outcome.as_str()
            )));
        }
        let already_reverted = self
            .registry
            .moves_for_file(entry.file_id)?
            .iter()
            .any(|m| m.reverts == Some(move_id));
        if already_reverted {
            return Err(StowageError::RollbackRefused(format!(
                "move {} was already rolled back",
                move_id
            )));
        }

        let record = self
            .registry
            .get_file(entry.file_id)?
            .ok_or(StowageError::RecordNotFound(entry.file_id))?;
        if record.state != CanonicalState::Organized || record.current_path != entry.destination_path {
            return Err(StowageError::RollbackRefused(format!(
                "file {} is no longer organized at {}",
                record.id,
                entry.destination_path.display()
            )));
        }
        let expected = record.full_fingerprint.clone().ok_or_else(|| {
            StowageError::RollbackRefused(format!("file {} has no full fingerprint", record.id))
        })?;
        let backup = entry.backup_path.clone().ok_or_else(|| {
            StowageError::RollbackRefused(format!("move {} has no backup", move_id))
        })?;
        if entry.original_path.exists() {
            return Err(StowageError::RollbackRefused(format!(
                "original path {} is occupied",
                entry.original_path.display()
            )));
        }

        log::info!(
            "Rolling back move {}: restoring {} from {}",
            move_id,
            entry.original_path.display(),
            backup.display()
        );

        self.transfer.copy(&backup, &entry.original_path)?;
        let restored = full_fingerprint(&entry.original_path)?;
        if restored != expected {
            let _ = fs::remove_file(&entry.original_path);
            return Err(StowageError::BackupVerificationFailed {
                path: backup,
                expected,
                actual: restored,
            });
        }

        let revert = NewMove {
            file_id: entry.file_id,
            run_id: entry.run_id,
            original_path: entry.original_path.clone(),
            destination_path: entry.destination_path.clone(),
            backup_path: Some(backup),
            outcome: MoveOutcome::RolledBack,
            reverts: Some(move_id),
            error: None,
        };
        let transition = StateTransition {
            to: CanonicalState::Registered,
            current_path: entry.original_path.clone(),
            full_fingerprint: None,
        };
        let stored = match self.registry.record_move(&revert, Some(&transition)) {
            Ok(stored) => stored,
            Err(e) => {
                let _ = fs::remove_file(&entry.original_path);
                return Err(e);
            }
        };

        match fingerprint_matches(&entry.destination_path, &expected) {
            Ok(true) => {
                if let Err(e) = fs::remove_file(&entry.destination_path) {
                    log::warn!(
                        "Could not remove {}: {}",
                        entry.destination_path.display(),
                        e
                    );
                }
            }
            Ok(false) => log::warn!(
                "{} no longer matches file {}; left in place",
                entry.destination_path.display(),
                record.id
            ),
            Err(e) => log::warn!(
                "Could not check {}: {}",
                entry.destination_path.display(),
                e
            ),
        }

        log::info!("Rolled back move {} for file {}", move_id, record.id);
        Ok(stored)
    }

    /// Rolls back the file's most recent move.
    pub fn rollback_file(&mut self, file_id: i64) -> Result<MoveRecord> {
        let latest = self
            .registry
            .latest_move_for_file(file_id)?
            .ok_or_else(|| StowageError::RollbackRefused(format!("file {} was never moved", file_id)))?;
        self.rollback_move(latest.id)
    }

    /// Rolls back every successful move of a run, newest first. A move that
    /// cannot be rolled back is reported and the rest continue.
    pub fn rollback_run(&mut self, run_id: i64) -> Result<RollbackReport> {
        let moves = self.registry.moves_for_run(run_id)?;
        let reverted: Vec<i64> = moves.iter().filter_map(|m| m.reverts).collect();
        let candidates: Vec<i64> = moves
            .iter()
            .filter(|m| m.outcome == MoveOutcome::Success && !reverted.contains(&m.id))
            .map(|m| m.id)
            .collect();

        log::info!(
            "Rolling back {} move(s) from run {}",
            candidates.len(),
            run_id
        );

        let mut report = RollbackReport::default();
        for move_id in candidates.into_iter().rev() {
            match self.rollback_move(move_id) {
                Ok(_) => report.rolled_back.push(move_id),
                Err(e) => {
                    log::error!("Failed to roll back move {}: {}", move_id, e);
                    report.failures.push((move_id, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::db::{NewFile, SqliteRegistry};
    use crate::migrate::engine::{ExecutorOptions, MigrationExecutor};
    use crate::migrate::planner::MovePlan;
    use crate::migrate::transfer::LocalTransfer;
    use tempfile::TempDir;

    fn moved_file(temp_dir: &TempDir, registry: &mut SqliteRegistry, run_id: Option<i64>, name: &str) -> MoveRecord {
        let config = EngineConfig::new(temp_dir.path().join("canon"), temp_dir.path().join("bak"));
        let source = temp_dir.path().join("drop").join(name);
        fs::create_dir_all(source.parent().unwrap()).unwrap();
        fs::write(&source, name.as_bytes()).unwrap();
        let full = full_fingerprint(&source).unwrap();

        let record = registry.register_file(&NewFile::new(&source, 1, 1)).unwrap();
        let record = registry.update_fingerprints(record.id, "q", Some(&full)).unwrap();
        let plan = MovePlan {
            file_id: record.id,
            source: source.clone(),
            destination: config.canonical_root.join("docs").join(name),
            size_bytes: name.len() as u64,
            category: "docs".to_string(),
            full_fingerprint: full,
            short_id: record.short_id(),
        };

        let report = MigrationExecutor::new(
            registry,
            &config,
            Arc::new(LocalTransfer::default()),
            ExecutorOptions {
                dry_run: false,
                run_id,
            },
        )
        .execute(vec![plan])
        .unwrap();
        assert_eq!(report.moved, 1);
        report.records[0].clone()
    }

    #[test]
    fn test_rollback_restores_file_and_state() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        let moved = moved_file(&temp_dir, &mut registry, None, "a.txt");

        let transfer: Arc<dyn Transfer> = Arc::new(LocalTransfer::default());
        let revert = RollbackEngine::new(&mut registry, transfer)
            .rollback_move(moved.id)
            .unwrap();

        assert_eq!(revert.outcome, MoveOutcome::RolledBack);
        assert_eq!(revert.reverts, Some(moved.id));
        assert_eq!(fs::read(&moved.original_path).unwrap(), b"a.txt");
        assert!(!moved.destination_path.exists());

        let record = registry.get_file(moved.file_id).unwrap().unwrap();
        assert_eq!(record.state, CanonicalState::Registered);
        assert_eq!(record.current_path, moved.original_path);
    }

    #[test]
    fn test_rollback_twice_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        let moved = moved_file(&temp_dir, &mut registry, None, "a.txt");

        let transfer: Arc<dyn Transfer> = Arc::new(LocalTransfer::default());
        let mut engine = RollbackEngine::new(&mut registry, transfer);
        engine.rollback_move(moved.id).unwrap();
        let err = engine.rollback_move(moved.id).unwrap_err();
        assert!(matches!(err, StowageError::RollbackRefused(_)));

        let err = engine.rollback_move(moved.id + 1).unwrap_err();
        assert!(matches!(err, StowageError::RollbackRefused(_)));
    }

    #[test]
    fn test_occupied_original_path_is_refused() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        let moved = moved_file(&temp_dir, &mut registry, None, "a.txt");
        fs::write(&moved.original_path, b"squatter").unwrap();

        let transfer: Arc<dyn Transfer> = Arc::new(LocalTransfer::default());
        let err = RollbackEngine::new(&mut registry, transfer)
            .rollback_file(moved.file_id)
            .unwrap_err();
        assert!(matches!(err, StowageError::RollbackRefused(_)));
        assert!(moved.destination_path.exists());
        assert_eq!(
            registry.get_file(moved.file_id).unwrap().unwrap().state,
            CanonicalState::Organized
        );
    }

    #[test]
    fn test_rollback_run_reverts_every_move() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        let run_id = registry.start_run().unwrap();
        let a = moved_file(&temp_dir, &mut registry, Some(run_id), "a.txt");
        let b = moved_file(&temp_dir, &mut registry, Some(run_id), "b.txt");

        let transfer: Arc<dyn Transfer> = Arc::new(LocalTransfer::default());
        let report = RollbackEngine::new(&mut registry, transfer)
            .rollback_run(run_id)
            .unwrap();

        assert_eq!(report.rolled_back, vec![b.id, a.id]);
        assert!(report.failures.is_empty());
        assert!(a.original_path.exists());
        assert!(b.original_path.exists());
    }
}
