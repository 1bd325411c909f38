use crate::config::DisplacementPolicy;
use crate::db::{CanonicalState, FileRecord, Registry};
use crate::error::Result;
use std::cmp::Ordering;

/// Outcome of resolving one shared full fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub fingerprint: String,
    pub kept_id: i64,
    pub duplicate_ids: Vec<i64>,
    /// Set when a strictly higher-priority record lost only because another
    /// copy was already organized. Such a record can be retained instead only
    /// through an explicit reconsolidation.
    pub displaced_by: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DedupStats {
    pub fingerprints: usize,
    pub duplicates_marked: usize,
    pub pending_reconsolidations: Vec<String>,
}

/// Total order used to choose the retained copy: source priority descending,
/// then first-seen ascending, then original path.
pub fn rank(a: &FileRecord, b: &FileRecord) -> Ordering {
    b.source_priority
        .cmp(&a.source_priority)
        .then_with(|| a.first_seen.cmp(&b.first_seen))
        .then_with(|| a.original_path.cmp(&b.original_path))
}

pub fn preferred<'a>(records: &'a [FileRecord]) -> Option<&'a FileRecord> {
    records.iter().min_by(|a, b| rank(a, b))
}

#[derive(Debug, Clone, Copy)]
pub struct DuplicateResolver {
    policy: DisplacementPolicy,
}

impl DuplicateResolver {
    pub fn new(policy: DisplacementPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> DisplacementPolicy {
        self.policy
    }

    /// Picks the retained record among `candidates`, which must share one
    /// full fingerprint. Records already marked duplicate or still pending
    /// are ignored. Only registered or organized records can be retained;
    /// quarantined copies may lose but never win. An organized copy is always
    /// retained here; displacing it is left to reconsolidation.
    pub fn decide(&self, candidates: &[FileRecord]) -> Option<Resolution> {
        let live: Vec<FileRecord> = candidates
            .iter()
            .filter(|r| {
                !matches!(r.state, CanonicalState::Duplicate | CanonicalState::Pending)
                    && r.full_fingerprint.is_some()
            })
            .cloned()
            .collect();
        if live.len() < 2 {
            return None;
        }

        let retainable: Vec<FileRecord> = live
            .iter()
            .filter(|r| matches!(r.state, CanonicalState::Registered | CanonicalState::Organized))
            .cloned()
            .collect();

        let fingerprint = live[0].full_fingerprint.clone()?;
        let best = preferred(&retainable)?;
        let organized = live.iter().find(|r| r.state == CanonicalState::Organized);

        let (kept, displaced_by) = match organized {
            Some(organized) if organized.id != best.id => {
                let outranked = best.source_priority > organized.source_priority;
                (organized, outranked.then_some(best.id))
            }
            Some(organized) => (organized, None),
            None => (best, None),
        };

        let mut duplicate_ids: Vec<i64> = live
            .iter()
            .filter(|r| r.id != kept.id)
            .map(|r| r.id)
            .collect();
        duplicate_ids.sort_unstable();

        Some(Resolution {
            fingerprint,
            kept_id: kept.id,
            duplicate_ids,
            displaced_by,
        })
    }

    /// Resolves one fingerprint and persists the links.
    pub fn resolve_fingerprint<R: Registry + ?Sized>(
        &self,
        registry: &mut R,
        fingerprint: &str,
    ) -> Result<Option<Resolution>> {
        let candidates = registry.find_by_full_fingerprint(fingerprint)?;
        let Some(resolution) = self.decide(&candidates) else {
            return Ok(None);
        };

        for &duplicate_id in &resolution.duplicate_ids {
            registry.mark_duplicate(duplicate_id, resolution.kept_id)?;
        }

        if let Some(newcomer) = resolution.displaced_by {
            match self.policy {
                DisplacementPolicy::Conservative => log::warn!(
                    "File {} outranks organized file {} for {}; left in place until reconsolidated",
                    newcomer,
                    resolution.kept_id,
                    fingerprint
                ),
                DisplacementPolicy::Eager => log::info!(
                    "File {} outranks organized file {} for {}; reconsolidation scheduled",
                    newcomer,
                    resolution.kept_id,
                    fingerprint
                ),
            }
        }

        Ok(Some(resolution))
    }

    /// Resolves every fingerprint still shared by more than one live record.
    /// A failure on one fingerprint is logged and does not stop the others.
    pub fn resolve_all<R: Registry + ?Sized>(&self, registry: &mut R) -> Result<DedupStats> {
        let mut stats = DedupStats::default();

        for fingerprint in registry.shared_full_fingerprints()? {
            match self.resolve_fingerprint(registry, &fingerprint) {
                Ok(Some(resolution)) => {
                    stats.fingerprints += 1;
                    stats.duplicates_marked += resolution.duplicate_ids.len();
                    if resolution.displaced_by.is_some() {
                        stats.pending_reconsolidations.push(fingerprint);
                    }
                }
                Ok(None) => {}
                Err(e) => log::error!("Duplicate resolution failed for {}: {}", fingerprint, e),
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MoveLog, MoveOutcome, NewFile, NewMove, SqliteRegistry, StateTransition};
    use chrono::{Duration, Utc};
    use std::path::PathBuf;

    fn record(id: i64, path: &str, priority: i64, age_days: i64, state: CanonicalState) -> FileRecord {
        let seen = Utc::now() - Duration::days(age_days);
        FileRecord {
            id,
            original_path: PathBuf::from(path),
            current_path: PathBuf::from(path),
            source_root: None,
            quick_fingerprint: Some("1-q".to_string()),
            full_fingerprint: Some("same".to_string()),
            size_bytes: 1,
            modified_at: None,
            category: None,
            entity: None,
            confidence: None,
            method: None,
            source_priority: priority,
            state,
            error: None,
            first_seen: seen,
            updated_at: seen,
        }
    }

    #[test]
    fn test_priority_then_age_then_path() {
        let resolver = DuplicateResolver::new(DisplacementPolicy::Conservative);
        let registered = CanonicalState::Registered;

        let by_priority = resolver
            .decide(&[record(1, "/a", 50, 10, registered), record(2, "/b", 100, 1, registered)])
            .unwrap();
        assert_eq!(by_priority.kept_id, 2);
        assert_eq!(by_priority.duplicate_ids, vec![1]);

        let by_age = resolver
            .decide(&[record(1, "/a", 100, 1, registered), record(2, "/b", 100, 5, registered)])
            .unwrap();
        assert_eq!(by_age.kept_id, 2);

        let a = record(1, "/z", 100, 3, registered);
        let mut b = record(2, "/a", 100, 3, registered);
        b.first_seen = a.first_seen;
        let by_path = resolver.decide(&[a, b]).unwrap();
        assert_eq!(by_path.kept_id, 2);
    }

    #[test]
    fn test_organized_copy_is_not_displaced() {
        let resolver = DuplicateResolver::new(DisplacementPolicy::Conservative);
        let resolution = resolver
            .decide(&[
                record(1, "/low", 50, 10, CanonicalState::Organized),
                record(2, "/high", 100, 1, CanonicalState::Registered),
                record(3, "/lower", 10, 1, CanonicalState::Quarantined),
            ])
            .unwrap();

        assert_eq!(resolution.kept_id, 1);
        assert_eq!(resolution.duplicate_ids, vec![2, 3]);
        assert_eq!(resolution.displaced_by, Some(2));
    }

    #[test]
    fn test_equal_priority_newcomer_is_not_a_displacement() {
        let resolver = DuplicateResolver::new(DisplacementPolicy::Eager);
        let resolution = resolver
            .decide(&[
                record(1, "/b", 100, 1, CanonicalState::Organized),
                record(2, "/a", 100, 10, CanonicalState::Registered),
            ])
            .unwrap();
        assert_eq!(resolution.kept_id, 1);
        assert_eq!(resolution.displaced_by, None);
    }

    #[test]
    fn test_quarantined_copy_never_wins() {
        let resolver = DuplicateResolver::new(DisplacementPolicy::Conservative);
        let resolution = resolver
            .decide(&[
                record(1, "/laptop/a.bin", 100, 10, CanonicalState::Quarantined),
                record(2, "/phone/a.txt", 50, 1, CanonicalState::Registered),
            ])
            .unwrap();
        assert_eq!(resolution.kept_id, 2);
        assert_eq!(resolution.duplicate_ids, vec![1]);
        assert_eq!(resolution.displaced_by, None);

        assert!(resolver
            .decide(&[
                record(1, "/a", 100, 1, CanonicalState::Quarantined),
                record(2, "/b", 50, 1, CanonicalState::Quarantined),
            ])
            .is_none());
    }

    #[test]
    fn test_single_live_record_needs_no_resolution() {
        let resolver = DuplicateResolver::new(DisplacementPolicy::Conservative);
        assert!(resolver
            .decide(&[
                record(1, "/a", 100, 1, CanonicalState::Registered),
                record(2, "/b", 50, 1, CanonicalState::Duplicate),
            ])
            .is_none());
    }

    #[test]
    fn test_resolve_all_persists_links_once() {
        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();

        let mut ids = Vec::new();
        for (path, priority) in [("/phone/a.jpg", 50), ("/laptop/a.jpg", 100), ("/usb/a.jpg", 10)] {
            let r = registry.register_file(&NewFile::new(path, 1, priority)).unwrap();
            registry.update_fingerprints(r.id, "1-q", Some("same")).unwrap();
            ids.push(r.id);
        }

        let resolver = DuplicateResolver::new(DisplacementPolicy::Conservative);
        let stats = resolver.resolve_all(&mut registry).unwrap();
        assert_eq!(stats.fingerprints, 1);
        assert_eq!(stats.duplicates_marked, 2);

        let links = registry.duplicate_links_for(ids[1]).unwrap();
        assert_eq!(links.len(), 2);

        let again = resolver.resolve_all(&mut registry).unwrap();
        assert_eq!(again, DedupStats::default());
    }

    #[test]
    fn test_late_higher_priority_copy_becomes_duplicate_of_organized() {
        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();

        let first = registry.register_file(&NewFile::new("/phone/a.jpg", 1, 50)).unwrap();
        registry.update_fingerprints(first.id, "1-q", Some("same")).unwrap();
        registry
            .record_move(
                &NewMove {
                    file_id: first.id,
                    run_id: None,
                    original_path: PathBuf::from("/phone/a.jpg"),
                    destination_path: PathBuf::from("/canon/photo/a.jpg"),
                    backup_path: None,
                    outcome: MoveOutcome::Success,
                    reverts: None,
                    error: None,
                },
                Some(&StateTransition {
                    to: CanonicalState::Organized,
                    current_path: PathBuf::from("/canon/photo/a.jpg"),
                    full_fingerprint: None,
                }),
            )
            .unwrap();

        let late = registry.register_file(&NewFile::new("/laptop/a.jpg", 1, 100)).unwrap();
        registry.update_fingerprints(late.id, "1-q", Some("same")).unwrap();

        let resolver = DuplicateResolver::new(DisplacementPolicy::Conservative);
        let stats = resolver.resolve_all(&mut registry).unwrap();
        assert_eq!(stats.pending_reconsolidations, vec!["same".to_string()]);

        assert_eq!(
            registry.get_file(first.id).unwrap().unwrap().state,
            CanonicalState::Organized
        );
        assert_eq!(
            registry.get_file(late.id).unwrap().unwrap().state,
            CanonicalState::Duplicate
        );
    }
}
