use crate::db::files::{apply_transition, require_file, set_current_path};
use crate::db::{
    now_timestamp, parse_column, parse_timestamp, path_text, MoveOutcome, MoveRecord, NewMove,
    RunRecord, StateTransition,
};
use crate::error::{Result, StowageError};
use rusqlite::{named_params, Connection, OptionalExtension};
use std::path::PathBuf;

const MOVE_COLUMNS: &str = "id, file_id, run_id, original_path, destination_path, backup_path,
    outcome, reverts, error, timestamp";

/// Appends a move row and, when given, applies the matching state transition
/// in the same transaction. Either both land or neither does.
pub fn record_move(
    conn: &Connection,
    entry: &NewMove,
    transition: Option<&StateTransition>,
) -> Result<MoveRecord> {
    let tx = conn.unchecked_transaction()?;

    tx.execute(
        "INSERT INTO move_log (
            file_id, run_id, original_path, destination_path, backup_path,
            outcome, reverts, error, timestamp
        ) VALUES (
            :file_id, :run_id, :original_path, :destination_path, :backup_path,
            :outcome, :reverts, :error, :timestamp
        )",
        named_params! {
            ":file_id": entry.file_id,
            ":run_id": entry.run_id,
            ":original_path": path_text(&entry.original_path),
            ":destination_path": path_text(&entry.destination_path),
            ":backup_path": entry.backup_path.as_deref().map(path_text),
            ":outcome": entry.outcome.as_str(),
            ":reverts": entry.reverts,
            ":error": &entry.error,
            ":timestamp": now_timestamp(),
        },
    )?;
    let move_id = tx.last_insert_rowid();

    if let Some(transition) = transition {
        let record = require_file(&tx, entry.file_id)?;
        if let Some(full) = &transition.full_fingerprint {
            tx.execute(
                "UPDATE files SET full_fingerprint = ?1 WHERE id = ?2",
                (full, entry.file_id),
            )?;
        }
        set_current_path(&tx, entry.file_id, &transition.current_path)?;
        if record.state != transition.to {
            apply_transition(
                &tx,
                &record,
                transition.to,
                &format!("move {} {}", move_id, entry.outcome.as_str()),
            )?;
        }
    }

    let stored = get_move(&tx, move_id)?.ok_or(StowageError::MoveNotFound(move_id))?;
    tx.commit()?;
    Ok(stored)
}

pub fn get_move(conn: &Connection, id: i64) -> Result<Option<MoveRecord>> {
    let sql = format!("SELECT {} FROM move_log WHERE id = ?1", MOVE_COLUMNS);
    let record = conn.query_row(&sql, [id], parse_move_row).optional()?;
    Ok(record)
}

pub fn moves_for_file(conn: &Connection, file_id: i64) -> Result<Vec<MoveRecord>> {
    let sql = format!(
        "SELECT {} FROM move_log WHERE file_id = ?1 ORDER BY id ASC",
        MOVE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let moves = stmt
        .query_map([file_id], parse_move_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(moves)
}

pub fn moves_for_run(conn: &Connection, run_id: i64) -> Result<Vec<MoveRecord>> {
    let sql = format!(
        "SELECT {} FROM move_log WHERE run_id = ?1 ORDER BY id ASC",
        MOVE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let moves = stmt
        .query_map([run_id], parse_move_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(moves)
}

pub fn latest_move_for_file(conn: &Connection, file_id: i64) -> Result<Option<MoveRecord>> {
    let sql = format!(
        "SELECT {} FROM move_log WHERE file_id = ?1 ORDER BY id DESC LIMIT 1",
        MOVE_COLUMNS
    );
    let record = conn.query_row(&sql, [file_id], parse_move_row).optional()?;
    Ok(record)
}

pub fn start_run(conn: &Connection) -> Result<i64> {
    conn.execute("INSERT INTO runs (started_at) VALUES (?1)", [now_timestamp()])?;
    Ok(conn.last_insert_rowid())
}

pub fn finish_run(conn: &Connection, run_id: i64, summary: &serde_json::Value) -> Result<()> {
    let summary_json = serde_json::to_string(summary)?;
    let changed = conn.execute(
        "UPDATE runs SET finished_at = ?1, summary = ?2 WHERE id = ?3",
        (now_timestamp(), summary_json, run_id),
    )?;
    if changed == 0 {
        return Err(StowageError::Config(format!("Unknown run: {}", run_id)));
    }
    Ok(())
}

pub fn list_runs(conn: &Connection) -> Result<Vec<RunRecord>> {
    let mut stmt = conn.prepare("SELECT id, started_at, finished_at, summary FROM runs ORDER BY id")?;
    let runs = stmt
        .query_map([], |row| {
            let summary: Option<String> = row.get(3)?;
            Ok(RunRecord {
                id: row.get(0)?,
                started_at: parse_timestamp(1, &row.get::<_, String>(1)?)?,
                finished_at: row
                    .get::<_, Option<String>>(2)?
                    .map(|s| parse_timestamp(2, &s))
                    .transpose()?,
                summary: summary
                    .map(|s| serde_json::from_str(&s))
                    .transpose()
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(
                            3,
                            rusqlite::types::Type::Text,
                            Box::new(e),
                        )
                    })?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(runs)
}

fn parse_move_row(row: &rusqlite::Row) -> rusqlite::Result<MoveRecord> {
    Ok(MoveRecord {
        id: row.get(0)?,
        file_id: row.get(1)?,
        run_id: row.get(2)?,
        original_path: PathBuf::from(row.get::<_, String>(3)?),
        destination_path: PathBuf::from(row.get::<_, String>(4)?),
        backup_path: row.get::<_, Option<String>>(5)?.map(PathBuf::from),
        outcome: parse_column(6, &row.get::<_, String>(6)?, MoveOutcome::from_str)?,
        reverts: row.get(7)?,
        error: row.get(8)?,
        timestamp: parse_timestamp(9, &row.get::<_, String>(9)?)?,
    })
}
