use crate::db::files::{apply_transition, require_file};
use crate::db::{now_timestamp, parse_timestamp, CanonicalState, DuplicateLink};
use crate::error::{Result, StowageError};
use rusqlite::{Connection, OptionalExtension};

/// Marks `duplicate_id` as a duplicate of `kept_id` and links the two. The
/// kept record must be registered or organized.
///
/// Idempotent: an existing link to the same kept record is returned as is.
/// Links that pointed at the new duplicate are re-pointed to `kept_id` so
/// every duplicate always links to a retained record.
pub fn mark_duplicate(conn: &Connection, duplicate_id: i64, kept_id: i64) -> Result<DuplicateLink> {
    if duplicate_id == kept_id {
        return Err(StowageError::FingerprintMismatch {
            kept: kept_id,
            duplicate: duplicate_id,
        });
    }

    let tx = conn.unchecked_transaction()?;
    let duplicate = require_file(&tx, duplicate_id)?;
    let kept = require_file(&tx, kept_id)?;

    match (&duplicate.full_fingerprint, &kept.full_fingerprint) {
        (Some(a), Some(b)) if a == b => {}
        _ => {
            return Err(StowageError::FingerprintMismatch {
                kept: kept_id,
                duplicate: duplicate_id,
            })
        }
    }

    if !matches!(kept.state, CanonicalState::Registered | CanonicalState::Organized) {
        return Err(StowageError::InvalidStateTransition {
            from: kept.state.as_str().to_string(),
            to: "kept".to_string(),
        });
    }

    if let Some(existing) = get_link_for_duplicate(&tx, duplicate_id)? {
        if existing.kept_id == kept_id {
            return Ok(existing);
        }
    }

    if duplicate.state != CanonicalState::Duplicate {
        apply_transition(
            &tx,
            &duplicate,
            CanonicalState::Duplicate,
            &format!("duplicate of {}", kept_id),
        )?;
    }

    let now = now_timestamp();
    tx.execute(
        "INSERT INTO duplicate_links (kept_id, duplicate_id, discovered_at)
         VALUES (?1, ?2, ?3)
         ON CONFLICT(duplicate_id) DO UPDATE SET kept_id = excluded.kept_id",
        (kept_id, duplicate_id, &now),
    )?;
    repoint_links(&tx, duplicate_id, kept_id)?;

    let link = get_link_for_duplicate(&tx, duplicate_id)?.ok_or(StowageError::RecordNotFound(duplicate_id))?;
    tx.commit()?;

    log::info!("File {} marked duplicate of {}", duplicate_id, kept_id);
    Ok(link)
}

pub fn promote_duplicate(conn: &Connection, id: i64, reason: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    let record = require_file(&tx, id)?;
    if record.state != CanonicalState::Duplicate {
        return Err(StowageError::InvalidStateTransition {
            from: record.state.as_str().to_string(),
            to: "promoted".to_string(),
        });
    }

    apply_transition(&tx, &record, CanonicalState::Registered, reason)?;
    tx.execute("DELETE FROM duplicate_links WHERE duplicate_id = ?1", [id])?;
    tx.commit()?;

    log::info!("File {} promoted from duplicate: {}", id, reason);
    Ok(())
}

pub(crate) fn repoint_links(conn: &Connection, from_kept: i64, to_kept: i64) -> Result<usize> {
    let changed = conn.execute(
        "UPDATE duplicate_links SET kept_id = ?1 WHERE kept_id = ?2",
        (to_kept, from_kept),
    )?;
    Ok(changed)
}

pub fn get_link_for_duplicate(conn: &Connection, duplicate_id: i64) -> Result<Option<DuplicateLink>> {
    let link = conn
        .query_row(
            "SELECT id, kept_id, duplicate_id, discovered_at
             FROM duplicate_links WHERE duplicate_id = ?1",
            [duplicate_id],
            parse_link_row,
        )
        .optional()?;
    Ok(link)
}

pub fn links_for_kept(conn: &Connection, kept_id: i64) -> Result<Vec<DuplicateLink>> {
    let mut stmt = conn.prepare(
        "SELECT id, kept_id, duplicate_id, discovered_at
         FROM duplicate_links WHERE kept_id = ?1 ORDER BY duplicate_id",
    )?;
    let links = stmt
        .query_map([kept_id], parse_link_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(links)
}

pub fn list_links(conn: &Connection) -> Result<Vec<DuplicateLink>> {
    let mut stmt = conn.prepare(
        "SELECT id, kept_id, duplicate_id, discovered_at FROM duplicate_links ORDER BY id",
    )?;
    let links = stmt
        .query_map([], parse_link_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(links)
}

fn parse_link_row(row: &rusqlite::Row) -> rusqlite::Result<DuplicateLink> {
    Ok(DuplicateLink {
        id: row.get(0)?,
        kept_id: row.get(1)?,
        duplicate_id: row.get(2)?,
        discovered_at: parse_timestamp(3, &row.get::<_, String>(3)?)?,
    })
}
