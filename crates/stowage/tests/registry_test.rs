mod common;

use common::*;
use stowage::db::{NewFile, StateCursor};
use stowage::*;

#[test]
fn test_reader_sees_only_committed_state() {
    let mut fx = TestFixture::new().unwrap();
    let record = fx
        .registry
        .register_file(&NewFile::new("/laptop/a.txt", 3, 100))
        .unwrap();
    fx.registry.update_fingerprints(record.id, "3-q", None).unwrap();

    let reader = SqliteRegistry::open(&fx.db_path).unwrap();

    fx.registry
        .conn()
        .execute_batch(&format!(
            "BEGIN IMMEDIATE;
             UPDATE files SET category = 'uncommitted' WHERE id = {};",
            record.id
        ))
        .unwrap();
    let seen = reader.get_file(record.id).unwrap().unwrap();
    assert_eq!(seen.category, None);
    assert_eq!(seen.state, CanonicalState::Registered);

    fx.registry.conn().execute_batch("COMMIT;").unwrap();
    let seen = reader.get_file(record.id).unwrap().unwrap();
    assert_eq!(seen.category.as_deref(), Some("uncommitted"));
}

#[test]
fn test_registry_is_durable_across_reopen() {
    let fx = TestFixture::new().unwrap();
    let db_path = fx.db_path.clone();
    let TestFixture {
        temp_dir,
        mut registry,
        ..
    } = fx;

    let record = registry
        .register_file(&NewFile::new("/phone/b.jpg", 10, 50))
        .unwrap();
    registry.update_fingerprints(record.id, "10-q", Some("full")).unwrap();
    drop(registry);

    let mut reopened = SqliteRegistry::open(&db_path).unwrap();
    reopened.initialize().unwrap();
    let found = reopened.find_by_full_fingerprint("full").unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].id, record.id);
    assert_eq!(found[0].source_priority, 50);

    let history = reopened.state_history(record.id).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].from_state, CanonicalState::Pending);
    assert_eq!(history[0].to_state, CanonicalState::Registered);
    drop(temp_dir);
}

#[test]
fn test_state_listing_can_resume_after_restart() {
    let mut fx = TestFixture::new().unwrap();
    for n in 0..5 {
        let record = fx
            .registry
            .register_file(&NewFile::new(format!("/laptop/{}.txt", n), 1, 1))
            .unwrap();
        fx.registry.update_fingerprints(record.id, "1-q", None).unwrap();
    }

    let mut cursor = fx.registry.list_by_state(CanonicalState::Registered).unwrap();
    let first: Vec<FileRecord> = cursor.by_ref().take(2).map(|r| r.unwrap()).collect();
    let key = cursor.position().cloned().unwrap();

    let reader = SqliteRegistry::open(&fx.db_path).unwrap();
    let rest: Vec<FileRecord> = StateCursor::resume(reader.conn(), CanonicalState::Registered, key)
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(first.len(), 2);
    assert_eq!(rest.len(), 3);
    let mut ids: Vec<i64> = first.iter().chain(rest.iter()).map(|r| r.id).collect();
    ids.dedup();
    assert_eq!(ids.len(), 5);
}

#[test]
fn test_corrupt_state_text_is_an_error() {
    let mut fx = TestFixture::new().unwrap();
    let record = fx
        .registry
        .register_file(&NewFile::new("/laptop/c.txt", 1, 1))
        .unwrap();
    fx.registry
        .conn()
        .execute("UPDATE files SET state = 'misplaced' WHERE id = ?1", [record.id])
        .unwrap();

    let err = fx.registry.get_file(record.id).unwrap_err();
    assert!(matches!(err, StowageError::Registry(_)));
}

#[test]
fn test_organized_copy_is_unique_per_content() {
    let mut fx = TestFixture::new().unwrap();
    let mut ids = Vec::new();
    for path in ["/laptop/x.bin", "/phone/x.bin"] {
        let record = fx.registry.register_file(&NewFile::new(path, 4, 1)).unwrap();
        fx.registry
            .update_fingerprints(record.id, "4-q", Some("same-content"))
            .unwrap();
        ids.push(record.id);
    }

    let organize = |id: i64, to: &str| {
        (
            stowage::db::NewMove {
                file_id: id,
                run_id: None,
                original_path: format!("/src/{}", id).into(),
                destination_path: to.into(),
                backup_path: None,
                outcome: MoveOutcome::Success,
                reverts: None,
                error: None,
            },
            stowage::db::StateTransition {
                to: CanonicalState::Organized,
                current_path: to.into(),
                full_fingerprint: None,
            },
        )
    };

    let (entry, transition) = organize(ids[0], "/canon/x.bin");
    fx.registry.record_move(&entry, Some(&transition)).unwrap();

    let (entry, transition) = organize(ids[1], "/canon/x__2.bin");
    assert!(fx.registry.record_move(&entry, Some(&transition)).is_err());

    let second = fx.registry.get_file(ids[1]).unwrap().unwrap();
    assert_eq!(second.state, CanonicalState::Registered);
    assert!(fx.registry.moves_for_file(ids[1]).unwrap().is_empty());
}
