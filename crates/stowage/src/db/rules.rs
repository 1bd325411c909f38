use crate::db::{now_timestamp, parse_column, parse_timestamp, NewRule, RuleKind, StoredRule};
use crate::error::{Result, StowageError};
use rusqlite::{named_params, Connection, OptionalExtension};

const RULE_COLUMNS: &str = "id, name, version, kind, category, priority, pattern, active, created_at";

/// Appends a new version of the named rule.
pub fn add_rule(conn: &Connection, rule: &NewRule) -> Result<StoredRule> {
    if rule.kind == RuleKind::Pattern && (rule.pattern.is_none() || rule.category.is_none()) {
        return Err(StowageError::Config(format!(
            "Pattern rule '{}' needs both a pattern and a category",
            rule.name
        )));
    }

    let tx = conn.unchecked_transaction()?;
    let version = next_version(&tx, &rule.name)?;
    tx.execute(
        "INSERT INTO classification_rules
            (name, version, kind, category, priority, pattern, active, created_at)
         VALUES (:name, :version, :kind, :category, :priority, :pattern, 1, :created_at)",
        named_params! {
            ":name": &rule.name,
            ":version": version,
            ":kind": rule.kind.as_str(),
            ":category": &rule.category,
            ":priority": rule.priority,
            ":pattern": &rule.pattern,
            ":created_at": now_timestamp(),
        },
    )?;
    let id = tx.last_insert_rowid();
    let stored = get_rule(&tx, id)?.ok_or_else(|| StowageError::Config(format!("Rule {} vanished", id)))?;
    tx.commit()?;

    log::debug!("Stored rule '{}' version {}", stored.name, stored.version);
    Ok(stored)
}

/// Appends an inactive version so the rule stops matching while its history
/// stays intact.
pub fn retire_rule(conn: &Connection, name: &str) -> Result<()> {
    let tx = conn.unchecked_transaction()?;
    let latest = latest_version(&tx, name)?
        .ok_or_else(|| StowageError::Config(format!("Unknown rule: {}", name)))?;

    if !latest.active {
        return Ok(());
    }

    tx.execute(
        "INSERT INTO classification_rules
            (name, version, kind, category, priority, pattern, active, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
        (
            &latest.name,
            latest.version + 1,
            latest.kind.as_str(),
            &latest.category,
            latest.priority,
            &latest.pattern,
            now_timestamp(),
        ),
    )?;
    tx.commit()?;
    Ok(())
}

/// Latest version of every rule whose latest version is active, highest
/// priority first.
pub fn active_rules(conn: &Connection) -> Result<Vec<StoredRule>> {
    let sql = format!(
        "SELECT {} FROM classification_rules r
         WHERE version = (SELECT MAX(version) FROM classification_rules WHERE name = r.name)
           AND active = 1
         ORDER BY priority DESC, name ASC",
        RULE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rules = stmt
        .query_map([], parse_rule_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rules)
}

pub fn get_rule(conn: &Connection, id: i64) -> Result<Option<StoredRule>> {
    let sql = format!("SELECT {} FROM classification_rules WHERE id = ?1", RULE_COLUMNS);
    let rule = conn.query_row(&sql, [id], parse_rule_row).optional()?;
    Ok(rule)
}

pub fn rule_versions(conn: &Connection, name: &str) -> Result<Vec<StoredRule>> {
    let sql = format!(
        "SELECT {} FROM classification_rules WHERE name = ?1 ORDER BY version ASC",
        RULE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rules = stmt
        .query_map([name], parse_rule_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rules)
}

fn latest_version(conn: &Connection, name: &str) -> Result<Option<StoredRule>> {
    let sql = format!(
        "SELECT {} FROM classification_rules WHERE name = ?1 ORDER BY version DESC LIMIT 1",
        RULE_COLUMNS
    );
    let rule = conn.query_row(&sql, [name], parse_rule_row).optional()?;
    Ok(rule)
}

fn next_version(conn: &Connection, name: &str) -> Result<i64> {
    let current: Option<i64> = conn.query_row(
        "SELECT MAX(version) FROM classification_rules WHERE name = ?1",
        [name],
        |row| row.get(0),
    )?;
    Ok(current.unwrap_or(0) + 1)
}

fn parse_rule_row(row: &rusqlite::Row) -> rusqlite::Result<StoredRule> {
    Ok(StoredRule {
        id: row.get(0)?,
        name: row.get(1)?,
        version: row.get(2)?,
        kind: parse_column(3, &row.get::<_, String>(3)?, RuleKind::from_str)?,
        category: row.get(4)?,
        priority: row.get(5)?,
        pattern: row.get(6)?,
        active: row.get(7)?,
        created_at: parse_timestamp(8, &row.get::<_, String>(8)?)?,
    })
}
