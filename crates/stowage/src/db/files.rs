use crate::db::{
    format_timestamp, now_timestamp, parse_column, parse_timestamp, path_text, CanonicalState,
    ClassificationMethod, FileRecord, NewFile, StateEvent,
};
use crate::error::{Result, StowageError};
use rusqlite::{named_params, Connection, OptionalExtension};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};

pub(crate) const FILE_COLUMNS: &str = "id, original_path, current_path, source_root,
    quick_fingerprint, full_fingerprint, size_bytes, modified_at, category, entity,
    confidence, method, source_priority, state, error, first_seen, updated_at";

const CURSOR_PAGE_SIZE: usize = 256;

pub fn register_file(conn: &Connection, file: &NewFile) -> Result<FileRecord> {
    let now = now_timestamp();
    conn.execute(
        "INSERT INTO files (
            original_path, current_path, source_root, size_bytes, modified_at,
            source_priority, state, first_seen, updated_at
        ) VALUES (
            :path, :path, :source_root, :size_bytes, :modified_at,
            :source_priority, 'pending', :now, :now
        )
        ON CONFLICT(original_path) DO NOTHING",
        named_params! {
            ":path": path_text(&file.path),
            ":source_root": file.source_root.as_deref().map(path_text),
            ":size_bytes": file.size_bytes as i64,
            ":modified_at": file.modified_at.as_ref().map(format_timestamp),
            ":source_priority": file.source_priority,
            ":now": &now,
        },
    )?;

    get_file_by_path(conn, &file.path)?.ok_or_else(|| StowageError::FileNotFound(file.path.clone()))
}

pub fn get_file(conn: &Connection, id: i64) -> Result<Option<FileRecord>> {
    let sql = format!("SELECT {} FROM files WHERE id = ?1", FILE_COLUMNS);
    let record = conn.query_row(&sql, [id], parse_file_row).optional()?;
    Ok(record)
}

pub(crate) fn require_file(conn: &Connection, id: i64) -> Result<FileRecord> {
    get_file(conn, id)?.ok_or(StowageError::RecordNotFound(id))
}

pub fn get_file_by_path(conn: &Connection, path: &Path) -> Result<Option<FileRecord>> {
    let sql = format!("SELECT {} FROM files WHERE original_path = ?1", FILE_COLUMNS);
    let record = conn
        .query_row(&sql, [path_text(path)], parse_file_row)
        .optional()?;
    Ok(record)
}

pub fn update_fingerprints(
    conn: &Connection,
    id: i64,
    quick: &str,
    full: Option<&str>,
) -> Result<FileRecord> {
    let tx = conn.unchecked_transaction()?;
    let record = require_file(&tx, id)?;

    tx.execute(
        "UPDATE files
         SET quick_fingerprint = ?1,
             full_fingerprint = COALESCE(?2, full_fingerprint),
             updated_at = ?3
         WHERE id = ?4",
        (quick, full, now_timestamp(), id),
    )?;

    if record.state == CanonicalState::Pending {
        apply_transition(&tx, &record, CanonicalState::Registered, "fingerprinted")?;
    }

    let updated = require_file(&tx, id)?;
    tx.commit()?;
    Ok(updated)
}

pub fn set_full_fingerprint(conn: &Connection, id: i64, full: &str) -> Result<()> {
    let changed = conn.execute(
        "UPDATE files SET full_fingerprint = ?1, updated_at = ?2 WHERE id = ?3",
        (full, now_timestamp(), id),
    )?;
    if changed == 0 {
        return Err(StowageError::RecordNotFound(id));
    }
    Ok(())
}

/// Records sharing content identity, in duplicate-resolution order.
pub fn find_by_full_fingerprint(conn: &Connection, digest: &str) -> Result<Vec<FileRecord>> {
    let sql = format!(
        "SELECT {} FROM files WHERE full_fingerprint = ?1
         ORDER BY source_priority DESC, first_seen ASC, original_path ASC",
        FILE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([digest], parse_file_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

pub fn find_by_quick_fingerprint(conn: &Connection, quick: &str) -> Result<Vec<FileRecord>> {
    let sql = format!(
        "SELECT {} FROM files WHERE quick_fingerprint = ?1 ORDER BY first_seen ASC, id ASC",
        FILE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map([quick], parse_file_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}

/// Quick fingerprints held by more than one record, any of which still lacks a
/// full fingerprint.
pub fn colliding_quick_fingerprints(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT quick_fingerprint FROM files
         WHERE quick_fingerprint IS NOT NULL
         GROUP BY quick_fingerprint
         HAVING COUNT(*) > 1 AND SUM(full_fingerprint IS NULL) > 0
         ORDER BY quick_fingerprint",
    )?;
    let fingerprints = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(fingerprints)
}

/// Full fingerprints shared by more than one record that is not yet marked as
/// a duplicate.
pub fn shared_full_fingerprints(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT full_fingerprint FROM files
         WHERE full_fingerprint IS NOT NULL AND state != 'duplicate'
         GROUP BY full_fingerprint
         HAVING COUNT(*) > 1
         ORDER BY full_fingerprint",
    )?;
    let fingerprints = stmt
        .query_map([], |row| row.get(0))?
        .collect::<std::result::Result<Vec<String>, _>>()?;
    Ok(fingerprints)
}

pub fn update_state(
    conn: &Connection,
    id: i64,
    new_state: CanonicalState,
    reason: &str,
) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    let record = require_file(&tx, id)?;

    if record.state == new_state {
        return Ok(());
    }

    // Organized is entered and left only together with a move log row.
    if record.state == CanonicalState::Organized || new_state == CanonicalState::Organized {
        return Err(StowageError::InvalidStateTransition {
            from: record.state.as_str().to_string(),
            to: new_state.as_str().to_string(),
        });
    }

    apply_transition(&tx, &record, new_state, reason)?;
    tx.commit()?;
    Ok(())
}

pub fn set_error(conn: &Connection, id: i64, error: Option<&str>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE files SET error = ?1, updated_at = ?2 WHERE id = ?3",
        (error, now_timestamp(), id),
    )?;
    if changed == 0 {
        return Err(StowageError::RecordNotFound(id));
    }
    Ok(())
}

pub(crate) fn set_current_path(conn: &Connection, id: i64, path: &Path) -> Result<()> {
    conn.execute(
        "UPDATE files SET current_path = ?1, updated_at = ?2 WHERE id = ?3",
        (path_text(path), now_timestamp(), id),
    )?;
    Ok(())
}

/// Validates and writes a state change plus its `state_events` row. Callers
/// own the surrounding transaction.
pub(crate) fn apply_transition(
    conn: &Connection,
    record: &FileRecord,
    to: CanonicalState,
    reason: &str,
) -> Result<()> {
    if !record.state.can_transition_to(to) {
        return Err(StowageError::InvalidStateTransition {
            from: record.state.as_str().to_string(),
            to: to.as_str().to_string(),
        });
    }

    let now = now_timestamp();
    conn.execute(
        "UPDATE files SET state = ?1, error = NULL, updated_at = ?2 WHERE id = ?3",
        (to.as_str(), &now, record.id),
    )?;
    conn.execute(
        "INSERT INTO state_events (file_id, from_state, to_state, reason, timestamp)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        (record.id, record.state.as_str(), to.as_str(), reason, &now),
    )?;

    log::debug!(
        "File {} {} -> {} ({})",
        record.id,
        record.state.as_str(),
        to.as_str(),
        reason
    );
    Ok(())
}

pub fn state_history(conn: &Connection, file_id: i64) -> Result<Vec<StateEvent>> {
    let mut stmt = conn.prepare(
        "SELECT id, file_id, from_state, to_state, reason, timestamp
         FROM state_events WHERE file_id = ?1 ORDER BY id ASC",
    )?;
    let events = stmt
        .query_map([file_id], |row| {
            Ok(StateEvent {
                id: row.get(0)?,
                file_id: row.get(1)?,
                from_state: parse_column(2, &row.get::<_, String>(2)?, CanonicalState::from_str)?,
                to_state: parse_column(3, &row.get::<_, String>(3)?, CanonicalState::from_str)?,
                reason: row.get(4)?,
                timestamp: parse_timestamp(5, &row.get::<_, String>(5)?)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(events)
}

pub(crate) fn parse_file_row(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        original_path: PathBuf::from(row.get::<_, String>(1)?),
        current_path: PathBuf::from(row.get::<_, String>(2)?),
        source_root: row.get::<_, Option<String>>(3)?.map(PathBuf::from),
        quick_fingerprint: row.get(4)?,
        full_fingerprint: row.get(5)?,
        size_bytes: row.get::<_, i64>(6)? as u64,
        modified_at: row
            .get::<_, Option<String>>(7)?
            .map(|s| parse_timestamp(7, &s))
            .transpose()?,
        category: row.get(8)?,
        entity: row.get(9)?,
        confidence: row.get(10)?,
        method: row
            .get::<_, Option<String>>(11)?
            .map(|s| parse_column(11, &s, ClassificationMethod::from_str))
            .transpose()?,
        source_priority: row.get(12)?,
        state: parse_column(13, &row.get::<_, String>(13)?, CanonicalState::from_str)?,
        error: row.get(14)?,
        first_seen: parse_timestamp(15, &row.get::<_, String>(15)?)?,
        updated_at: parse_timestamp(16, &row.get::<_, String>(16)?)?,
    })
}

/// Position of a `StateCursor`, usable to resume listing after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorKey {
    pub first_seen: String,
    pub id: i64,
}

/// Lazy listing of records in one state, ordered by first-seen then id.
///
/// Rows are fetched a page at a time; each page is a fresh read, so a
/// concurrent writer's commits become visible between pages and uncommitted
/// work never does.
pub struct StateCursor<'a> {
    conn: &'a Connection,
    state: CanonicalState,
    after: Option<CursorKey>,
    buffer: VecDeque<FileRecord>,
    exhausted: bool,
}

impl<'a> StateCursor<'a> {
    pub fn new(conn: &'a Connection, state: CanonicalState) -> Self {
        Self {
            conn,
            state,
            after: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    pub fn resume(conn: &'a Connection, state: CanonicalState, after: CursorKey) -> Self {
        Self {
            after: Some(after),
            ..Self::new(conn, state)
        }
    }

    /// Key of the last record handed out.
    pub fn position(&self) -> Option<&CursorKey> {
        self.after.as_ref()
    }

    fn fetch_page(&mut self) -> Result<()> {
        let (first_seen, id) = match &self.after {
            Some(key) => (key.first_seen.clone(), key.id),
            None => (String::new(), 0),
        };

        let sql = format!(
            "SELECT {} FROM files
             WHERE state = ?1 AND (first_seen > ?2 OR (first_seen = ?2 AND id > ?3))
             ORDER BY first_seen ASC, id ASC
             LIMIT ?4",
            FILE_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let page = stmt
            .query_map(
                (self.state.as_str(), &first_seen, id, CURSOR_PAGE_SIZE as i64),
                parse_file_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        if page.len() < CURSOR_PAGE_SIZE {
            self.exhausted = true;
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for StateCursor<'_> {
    type Item = Result<FileRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fetch_page() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }

        let record = self.buffer.pop_front()?;
        self.after = Some(CursorKey {
            first_seen: format_timestamp(&record.first_seen),
            id: record.id,
        });
        Some(Ok(record))
    }
}
