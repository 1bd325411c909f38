use crate::db::files::{apply_transition, require_file};
use crate::db::{
    now_timestamp, parse_column, parse_timestamp, CanonicalState, Classification,
    ClassificationEvent, ClassificationMethod, ManualCorrection, Routing,
};
use crate::error::{Result, StowageError};
use rusqlite::{named_params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

/// Appends a classification event and refreshes the record's current
/// classification fields. Routing moves a record between `registered` and
/// `quarantined`; organized and duplicate records keep their state.
pub fn record_classification(
    conn: &Connection,
    id: i64,
    classification: &Classification,
) -> Result<ClassificationEvent> {
    let tx = conn.unchecked_transaction()?;
    let record = require_file(&tx, id)?;

    if record.state == CanonicalState::Pending {
        return Err(StowageError::InvalidStateTransition {
            from: record.state.as_str().to_string(),
            to: "classified".to_string(),
        });
    }

    let now = now_timestamp();
    tx.execute(
        "INSERT INTO classification_events
            (file_id, category, entity, confidence, method, rule_id, degraded, timestamp)
         VALUES (:file_id, :category, :entity, :confidence, :method, :rule_id, :degraded, :timestamp)",
        named_params! {
            ":file_id": id,
            ":category": &classification.category,
            ":entity": &classification.entity,
            ":confidence": classification.confidence,
            ":method": classification.method.as_str(),
            ":rule_id": classification.rule_id,
            ":degraded": &classification.degraded,
            ":timestamp": &now,
        },
    )?;
    let event_id = tx.last_insert_rowid();

    tx.execute(
        "UPDATE files
         SET category = ?1, entity = ?2, confidence = ?3, method = ?4, updated_at = ?5
         WHERE id = ?6",
        (
            &classification.category,
            &classification.entity,
            classification.confidence,
            classification.method.as_str(),
            &now,
            id,
        ),
    )?;

    let target = match (record.state, classification.routing) {
        (CanonicalState::Registered, Routing::Quarantine) => Some(CanonicalState::Quarantined),
        (CanonicalState::Quarantined, Routing::Organize) => Some(CanonicalState::Registered),
        _ => None,
    };
    if let Some(target) = target {
        let reason = match classification.routing {
            Routing::Quarantine => format!(
                "confidence {:.2} below threshold for {}",
                classification.confidence, classification.category
            ),
            Routing::Organize => format!("reclassified as {}", classification.category),
        };
        apply_transition(&tx, &record, target, &reason)?;
    }

    let event = get_event(&tx, event_id)?.ok_or(StowageError::RecordNotFound(id))?;
    tx.commit()?;
    Ok(event)
}

pub fn classification_history(conn: &Connection, file_id: i64) -> Result<Vec<ClassificationEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, file_id, category, entity, confidence, method, rule_id, degraded, timestamp
         FROM classification_events WHERE file_id = ?1 ORDER BY id ASC",
    )?;
    let events = stmt
        .query_map([file_id], parse_event_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

fn get_event(conn: &Connection, id: i64) -> Result<Option<ClassificationEvent>> {
    let event = conn
        .query_row(
            "SELECT id, file_id, category, entity, confidence, method, rule_id, degraded, timestamp
             FROM classification_events WHERE id = ?1",
            [id],
            parse_event_row,
        )
        .optional()?;
    Ok(event)
}

/// Appends a manual correction. The record's own fields are left to the
/// reclassification that follows.
pub fn record_correction(
    conn: &Connection,
    file_id: i64,
    corrected_category: &str,
    corrected_by: &str,
) -> Result<ManualCorrection> {
    let record = require_file(conn, file_id)?;

    conn.execute(
        "INSERT INTO manual_corrections
            (file_id, previous_category, previous_method, corrected_category, corrected_by, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        (
            file_id,
            &record.category,
            record.method.map(|m| m.as_str()),
            corrected_category,
            corrected_by,
            now_timestamp(),
        ),
    )?;
    let id = conn.last_insert_rowid();

    log::info!(
        "File {} corrected {} -> {} by {}",
        file_id,
        record.category.as_deref().unwrap_or("-"),
        corrected_category,
        corrected_by
    );

    conn.query_row(
        &format!("{} WHERE id = ?1", CORRECTION_SELECT),
        [id],
        parse_correction_row,
    )
    .map_err(Into::into)
}

pub fn latest_correction(conn: &Connection, file_id: i64) -> Result<Option<ManualCorrection>> {
    let correction = conn
        .query_row(
            &format!("{} WHERE file_id = ?1 ORDER BY id DESC LIMIT 1", CORRECTION_SELECT),
            [file_id],
            parse_correction_row,
        )
        .optional()?;
    Ok(correction)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodAccuracy {
    pub method: ClassificationMethod,
    pub classified: u64,
    pub corrected: u64,
}

impl MethodAccuracy {
    pub fn accuracy(&self) -> f64 {
        if self.classified == 0 {
            return 1.0;
        }
        1.0 - (self.corrected.min(self.classified) as f64 / self.classified as f64)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrectionStats {
    pub total_corrections: u64,
    pub by_method: Vec<MethodAccuracy>,
}

/// Per-method counts of classified records and of records later corrected.
pub fn correction_stats(conn: &Connection) -> Result<CorrectionStats> {
    let total: i64 = conn.query_row("SELECT COUNT(*) FROM manual_corrections", [], |row| row.get(0))?;

    let mut stmt = conn.prepare(
        "SELECT e.method,
                COUNT(DISTINCT e.file_id),
                (SELECT COUNT(DISTINCT c.file_id) FROM manual_corrections c
                 WHERE c.previous_method = e.method)
         FROM classification_events e
         WHERE e.method != 'manual'
         GROUP BY e.method
         ORDER BY e.method",
    )?;
    let by_method = stmt
        .query_map([], |row| {
            Ok(MethodAccuracy {
                method: parse_column(0, &row.get::<_, String>(0)?, ClassificationMethod::from_str)?,
                classified: row.get::<_, i64>(1)? as u64,
                corrected: row.get::<_, i64>(2)? as u64,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(CorrectionStats {
        total_corrections: total as u64,
        by_method,
    })
}

const CORRECTION_SELECT: &str = "SELECT id, file_id, previous_category, previous_method,
    corrected_category, corrected_by, timestamp FROM manual_corrections";

fn parse_correction_row(row: &rusqlite::Row) -> rusqlite::Result<ManualCorrection> {
    Ok(ManualCorrection {
        id: row.get(0)?,
        file_id: row.get(1)?,
        previous_category: row.get(2)?,
        previous_method: row
            .get::<_, Option<String>>(3)?
            .map(|s| parse_column(3, &s, ClassificationMethod::from_str))
            .transpose()?,
        corrected_category: row.get(4)?,
        corrected_by: row.get(5)?,
        timestamp: parse_timestamp(6, &row.get::<_, String>(6)?)?,
    })
}

fn parse_event_row(row: &rusqlite::Row) -> rusqlite::Result<ClassificationEvent> {
    Ok(ClassificationEvent {
        id: row.get(0)?,
        file_id: row.get(1)?,
        category: row.get(2)?,
        entity: row.get(3)?,
        confidence: row.get(4)?,
        method: parse_column(5, &row.get::<_, String>(5)?, ClassificationMethod::from_str)?,
        rule_id: row.get(6)?,
        degraded: row.get(7)?,
        timestamp: parse_timestamp(8, &row.get::<_, String>(8)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{CorrectionStore, NewFile, Registry, SqliteRegistry};

    fn create_test_registry() -> SqliteRegistry {
        let mut registry = SqliteRegistry::open_in_memory().unwrap();
        registry.initialize().unwrap();
        registry
    }

    fn registered(registry: &mut SqliteRegistry, path: &str) -> i64 {
        let record = registry.register_file(&NewFile::new(path, 10, 1)).unwrap();
        registry.update_fingerprints(record.id, "10-q", None).unwrap();
        record.id
    }

    fn classification(category: &str, confidence: f64, method: ClassificationMethod, routing: Routing) -> Classification {
        Classification {
            category: category.to_string(),
            entity: None,
            confidence,
            method,
            rule_id: None,
            rule_name: None,
            degraded: None,
            routing,
        }
    }

    #[test]
    fn test_low_confidence_quarantines_and_keeps_guess() {
        let mut registry = create_test_registry();
        let id = registered(&mut registry, "/drop/scan.pdf");

        registry
            .record_classification(id, &classification("invoice", 0.4, ClassificationMethod::Model, Routing::Quarantine))
            .unwrap();

        let record = registry.get_file(id).unwrap().unwrap();
        assert_eq!(record.state, CanonicalState::Quarantined);
        assert_eq!(record.category.as_deref(), Some("invoice"));
        assert_eq!(record.confidence, Some(0.4));
        assert_eq!(record.method, Some(ClassificationMethod::Model));
    }

    #[test]
    fn test_reclassification_appends_history() {
        let mut registry = create_test_registry();
        let id = registered(&mut registry, "/drop/scan.pdf");

        registry
            .record_classification(id, &classification("invoice", 0.4, ClassificationMethod::Model, Routing::Quarantine))
            .unwrap();
        registry
            .record_classification(id, &classification("receipt", 1.0, ClassificationMethod::Manual, Routing::Organize))
            .unwrap();

        let history = registry.classification_history(id).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].category, "invoice");
        assert_eq!(history[1].category, "receipt");

        let record = registry.get_file(id).unwrap().unwrap();
        assert_eq!(record.state, CanonicalState::Registered);
        assert_eq!(record.category.as_deref(), Some("receipt"));
    }

    #[test]
    fn test_pending_record_cannot_be_classified() {
        let mut registry = create_test_registry();
        let record = registry.register_file(&NewFile::new("/drop/a", 1, 1)).unwrap();

        let err = registry
            .record_classification(record.id, &classification("x", 1.0, ClassificationMethod::Pattern, Routing::Organize))
            .unwrap_err();
        assert!(matches!(err, StowageError::InvalidStateTransition { .. }));
        assert!(registry.classification_history(record.id).unwrap().is_empty());
    }

    #[test]
    fn test_correction_stats_per_method() {
        let mut registry = create_test_registry();
        let a = registered(&mut registry, "/a");
        let b = registered(&mut registry, "/b");
        let c = registered(&mut registry, "/c");

        registry
            .record_classification(a, &classification("invoice", 0.9, ClassificationMethod::Model, Routing::Organize))
            .unwrap();
        registry
            .record_classification(b, &classification("invoice", 0.8, ClassificationMethod::Model, Routing::Organize))
            .unwrap();
        registry
            .record_classification(c, &classification("photo", 1.0, ClassificationMethod::Pattern, Routing::Organize))
            .unwrap();

        let correction = registry.record_correction(a, "receipt", "alex").unwrap();
        assert_eq!(correction.previous_category.as_deref(), Some("invoice"));
        assert_eq!(correction.previous_method, Some(ClassificationMethod::Model));
        assert_eq!(registry.latest_correction(a).unwrap().unwrap().id, correction.id);

        let stats = registry.correction_stats().unwrap();
        assert_eq!(stats.total_corrections, 1);
        assert_eq!(stats.by_method.len(), 2);

        let model = &stats.by_method[0];
        assert_eq!(model.method, ClassificationMethod::Model);
        assert_eq!(model.classified, 2);
        assert_eq!(model.corrected, 1);
        assert!((model.accuracy() - 0.5).abs() < f64::EPSILON);

        let pattern = &stats.by_method[1];
        assert_eq!(pattern.method, ClassificationMethod::Pattern);
        assert_eq!(pattern.corrected, 0);
    }
}
