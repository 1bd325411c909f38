use crate::error::Result;
use rusqlite::Connection;

pub const SCHEMA_VERSION: i32 = 1;

pub fn initialize_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );

        CREATE TABLE IF NOT EXISTS files (
            id                  INTEGER PRIMARY KEY,
            original_path       TEXT NOT NULL UNIQUE,
            current_path        TEXT NOT NULL,
            source_root         TEXT,
            quick_fingerprint   TEXT,
            full_fingerprint    TEXT,
            size_bytes          INTEGER NOT NULL,
            modified_at         TEXT,
            category            TEXT,
            entity              TEXT,
            confidence          REAL,
            method              TEXT,
            source_priority     INTEGER NOT NULL DEFAULT 0,
            state               TEXT NOT NULL DEFAULT 'pending',
            error               TEXT,
            first_seen          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS state_events (
            id              INTEGER PRIMARY KEY,
            file_id         INTEGER NOT NULL REFERENCES files(id),
            from_state      TEXT NOT NULL,
            to_state        TEXT NOT NULL,
            reason          TEXT NOT NULL,
            timestamp       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS classification_rules (
            id              INTEGER PRIMARY KEY,
            name            TEXT NOT NULL,
            version         INTEGER NOT NULL,
            kind            TEXT NOT NULL,
            category        TEXT,
            priority        INTEGER NOT NULL DEFAULT 50,
            pattern         TEXT,
            active          BOOLEAN NOT NULL DEFAULT 1,
            created_at      TEXT NOT NULL,
            UNIQUE(name, version)
        );

        CREATE TABLE IF NOT EXISTS classification_events (
            id              INTEGER PRIMARY KEY,
            file_id         INTEGER NOT NULL REFERENCES files(id),
            category        TEXT NOT NULL,
            entity          TEXT,
            confidence      REAL NOT NULL,
            method          TEXT NOT NULL,
            rule_id         INTEGER REFERENCES classification_rules(id),
            degraded        TEXT,
            timestamp       TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS manual_corrections (
            id                  INTEGER PRIMARY KEY,
            file_id             INTEGER NOT NULL REFERENCES files(id),
            previous_category   TEXT,
            previous_method     TEXT,
            corrected_category  TEXT NOT NULL,
            corrected_by        TEXT NOT NULL,
            timestamp           TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS duplicate_links (
            id              INTEGER PRIMARY KEY,
            kept_id         INTEGER NOT NULL REFERENCES files(id),
            duplicate_id    INTEGER NOT NULL UNIQUE REFERENCES files(id),
            discovered_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS runs (
            id              INTEGER PRIMARY KEY,
            started_at      TEXT NOT NULL,
            finished_at     TEXT,
            summary         TEXT
        );

        CREATE TABLE IF NOT EXISTS move_log (
            id                  INTEGER PRIMARY KEY,
            file_id             INTEGER NOT NULL REFERENCES files(id),
            run_id              INTEGER REFERENCES runs(id),
            original_path       TEXT NOT NULL,
            destination_path   TEXT NOT NULL,
            backup_path         TEXT,
            outcome             TEXT NOT NULL,
            reverts             INTEGER REFERENCES move_log(id),
            error               TEXT,
            timestamp           TEXT NOT NULL
        );

        CREATE TRIGGER IF NOT EXISTS move_log_append_only_update
        BEFORE UPDATE ON move_log
        BEGIN
            SELECT RAISE(ABORT, 'move_log is append-only');
        END;

        CREATE TRIGGER IF NOT EXISTS move_log_append_only_delete
        BEFORE DELETE ON move_log
        BEGIN
            SELECT RAISE(ABORT, 'move_log is append-only');
        END;
        "#,
    )?;

    create_indexes(conn)?;
    set_schema_version(conn)?;

    Ok(())
}

fn create_indexes(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE INDEX IF NOT EXISTS idx_files_quick ON files(quick_fingerprint);
        CREATE INDEX IF NOT EXISTS idx_files_full ON files(full_fingerprint);
        CREATE INDEX IF NOT EXISTS idx_files_state ON files(state, first_seen, id);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_files_organized_content
            ON files(full_fingerprint) WHERE state = 'organized';
        CREATE INDEX IF NOT EXISTS idx_state_events_file ON state_events(file_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_classification_events_file ON classification_events(file_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_rules_name ON classification_rules(name, version);
        CREATE INDEX IF NOT EXISTS idx_corrections_file ON manual_corrections(file_id);
        CREATE INDEX IF NOT EXISTS idx_duplicate_links_kept ON duplicate_links(kept_id);
        CREATE INDEX IF NOT EXISTS idx_move_log_file ON move_log(file_id, id);
        CREATE INDEX IF NOT EXISTS idx_move_log_run ON move_log(run_id);
        "#,
    )?;
    Ok(())
}

fn set_schema_version(conn: &Connection) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;
    Ok(())
}

pub fn get_schema_version(conn: &Connection) -> Result<Option<i32>> {
    let mut stmt = conn.prepare("SELECT version FROM schema_version LIMIT 1")?;
    let mut rows = stmt.query([])?;

    if let Some(row) = rows.next()? {
        Ok(Some(row.get(0)?))
    } else {
        Ok(None)
    }
}
