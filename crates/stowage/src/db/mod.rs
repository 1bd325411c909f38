pub mod corrections;
pub mod duplicates;
pub mod files;
pub mod moves;
pub mod rules;
pub mod schema;

use crate::config::EngineConfig;
use crate::error::{Result, StowageError};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::backup::Backup;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub use corrections::{CorrectionStats, MethodAccuracy};
pub use files::{CursorKey, StateCursor};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// One tracked filesystem path and its current lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub id: i64,
    pub original_path: PathBuf,
    pub current_path: PathBuf,
    pub source_root: Option<PathBuf>,
    pub quick_fingerprint: Option<String>,
    pub full_fingerprint: Option<String>,
    pub size_bytes: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub category: Option<String>,
    pub entity: Option<String>,
    pub confidence: Option<f64>,
    pub method: Option<ClassificationMethod>,
    pub source_priority: i64,
    pub state: CanonicalState,
    pub error: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRecord {
    /// Short identifier used to disambiguate colliding destination names.
    pub fn short_id(&self) -> String {
        match &self.full_fingerprint {
            Some(full) if full.len() >= 8 => full[..8].to_string(),
            _ => format!("r{}", self.id),
        }
    }

    pub fn file_name(&self) -> String {
        self.original_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| format!("file-{}", self.id))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum CanonicalState {
    Pending,
    Registered,
    Duplicate,
    Organized,
    Quarantined,
}

impl CanonicalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CanonicalState::Pending => "pending",
            CanonicalState::Registered => "registered",
            CanonicalState::Duplicate => "duplicate",
            CanonicalState::Organized => "organized",
            CanonicalState::Quarantined => "quarantined",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(CanonicalState::Pending),
            "registered" => Ok(CanonicalState::Registered),
            "duplicate" => Ok(CanonicalState::Duplicate),
            "organized" => Ok(CanonicalState::Organized),
            "quarantined" => Ok(CanonicalState::Quarantined),
            _ => Err(StowageError::Config(format!("Invalid canonical state: {}", s))),
        }
    }

    pub fn can_transition_to(&self, to: CanonicalState) -> bool {
        use CanonicalState::*;
        matches!(
            (self, to),
            (Pending, Registered)
                | (Registered, Duplicate)
                | (Registered, Organized)
                | (Registered, Quarantined)
                | (Quarantined, Registered)
                | (Quarantined, Duplicate)
                | (Duplicate, Registered)
                | (Organized, Registered)
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ClassificationMethod {
    Pattern,
    Model,
    Manual,
}

impl ClassificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClassificationMethod::Pattern => "pattern",
            ClassificationMethod::Model => "model",
            ClassificationMethod::Manual => "manual",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pattern" => Ok(ClassificationMethod::Pattern),
            "model" => Ok(ClassificationMethod::Model),
            "manual" => Ok(ClassificationMethod::Manual),
            _ => Err(StowageError::Config(format!(
                "Invalid classification method: {}",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Routing {
    Organize,
    Quarantine,
}

/// A classification decision, as produced by the dispatcher and persisted by
/// `Registry::record_classification`.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: String,
    pub entity: Option<String>,
    pub confidence: f64,
    pub method: ClassificationMethod,
    pub rule_id: Option<i64>,
    pub rule_name: Option<String>,
    pub degraded: Option<String>,
    pub routing: Routing,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationEvent {
    pub id: i64,
    pub file_id: i64,
    pub category: String,
    pub entity: Option<String>,
    pub confidence: f64,
    pub method: ClassificationMethod,
    pub rule_id: Option<i64>,
    pub degraded: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub id: i64,
    pub file_id: i64,
    pub from_state: CanonicalState,
    pub to_state: CanonicalState,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RuleKind {
    Pattern,
    Model,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Pattern => "pattern",
            RuleKind::Model => "model",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pattern" => Ok(RuleKind::Pattern),
            "model" => Ok(RuleKind::Model),
            _ => Err(StowageError::Config(format!("Invalid rule kind: {}", s))),
        }
    }
}

/// A rule as stored in the Registry. Rows are never edited; a change is a new
/// version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRule {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub kind: RuleKind,
    pub category: Option<String>,
    pub priority: i32,
    pub pattern: Option<String>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewRule {
    pub name: String,
    pub kind: RuleKind,
    pub category: Option<String>,
    pub priority: i32,
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MoveOutcome {
    Success,
    Failed,
    RolledBack,
}

impl MoveOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            MoveOutcome::Success => "success",
            MoveOutcome::Failed => "failed",
            MoveOutcome::RolledBack => "rolled_back",
        }
    }

    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "success" => Ok(MoveOutcome::Success),
            "failed" => Ok(MoveOutcome::Failed),
            "rolled_back" => Ok(MoveOutcome::RolledBack),
            _ => Err(StowageError::Config(format!("Invalid move outcome: {}", s))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoveRecord {
    pub id: i64,
    pub file_id: i64,
    pub run_id: Option<i64>,
    pub original_path: PathBuf,
    pub destination_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub outcome: MoveOutcome,
    pub reverts: Option<i64>,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewMove {
    pub file_id: i64,
    pub run_id: Option<i64>,
    pub original_path: PathBuf,
    pub destination_path: PathBuf,
    pub backup_path: Option<PathBuf>,
    pub outcome: MoveOutcome,
    pub reverts: Option<i64>,
    pub error: Option<String>,
}

/// State change applied in the same transaction as a move row.
#[derive(Debug, Clone, PartialEq)]
pub struct StateTransition {
    pub to: CanonicalState,
    pub current_path: PathBuf,
    pub full_fingerprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateLink {
    pub id: i64,
    pub kept_id: i64,
    pub duplicate_id: i64,
    pub discovered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualCorrection {
    pub id: i64,
    pub file_id: i64,
    pub previous_category: Option<String>,
    pub previous_method: Option<ClassificationMethod>,
    pub corrected_category: String,
    pub corrected_by: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary: Option<serde_json::Value>,
}

/// Input to `Registry::register_file`.
#[derive(Debug, Clone, PartialEq)]
pub struct NewFile {
    pub path: PathBuf,
    pub size_bytes: u64,
    pub source_priority: i64,
    pub source_root: Option<PathBuf>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl NewFile {
    pub fn new<P: Into<PathBuf>>(path: P, size_bytes: u64, source_priority: i64) -> Self {
        Self {
            path: path.into(),
            size_bytes,
            source_priority,
            source_root: None,
            modified_at: None,
        }
    }
}

/// File records, fingerprints, classification state and duplicate links.
pub trait Registry {
    fn initialize(&mut self) -> Result<()>;
    fn register_file(&mut self, file: &NewFile) -> Result<FileRecord>;
    fn get_file(&self, id: i64) -> Result<Option<FileRecord>>;
    fn get_file_by_path(&self, path: &Path) -> Result<Option<FileRecord>>;
    fn update_fingerprints(&mut self, id: i64, quick: &str, full: Option<&str>) -> Result<FileRecord>;
    fn set_full_fingerprint(&mut self, id: i64, full: &str) -> Result<()>;
    fn find_by_full_fingerprint(&self, digest: &str) -> Result<Vec<FileRecord>>;
    fn find_by_quick_fingerprint(&self, quick: &str) -> Result<Vec<FileRecord>>;
    fn colliding_quick_fingerprints(&self) -> Result<Vec<String>>;
    fn shared_full_fingerprints(&self) -> Result<Vec<String>>;
    fn record_classification(
        &mut self,
        id: i64,
        classification: &Classification,
    ) -> Result<ClassificationEvent>;
    fn update_state(&mut self, id: i64, new_state: CanonicalState, reason: &str) -> Result<()>;
    fn mark_duplicate(&mut self, duplicate_id: i64, kept_id: i64) -> Result<DuplicateLink>;
    /// Returns a duplicate to `registered` and drops its link, so it can be
    /// retained in place of its former kept record.
    fn promote_duplicate(&mut self, id: i64, reason: &str) -> Result<()>;
    fn set_error(&mut self, id: i64, error: Option<&str>) -> Result<()>;
    fn list_by_state(&self, state: CanonicalState) -> Result<StateCursor<'_>>;
    /// Detached in-memory copy of the committed contents. Writes to the copy
    /// never reach this Registry.
    fn snapshot(&self) -> Result<SqliteRegistry>;
}

/// Append-only move audit trail and the runs it belongs to.
pub trait MoveLog {
    fn record_move(
        &mut self,
        entry: &NewMove,
        transition: Option<&StateTransition>,
    ) -> Result<MoveRecord>;
    fn get_move(&self, id: i64) -> Result<Option<MoveRecord>>;
    fn moves_for_file(&self, file_id: i64) -> Result<Vec<MoveRecord>>;
    fn latest_move_for_file(&self, file_id: i64) -> Result<Option<MoveRecord>>;
    fn moves_for_run(&self, run_id: i64) -> Result<Vec<MoveRecord>>;
    fn start_run(&mut self) -> Result<i64>;
    fn finish_run(&mut self, run_id: i64, summary: &serde_json::Value) -> Result<()>;
}

pub trait RuleStore {
    fn add_rule(&mut self, rule: &NewRule) -> Result<StoredRule>;
    fn retire_rule(&mut self, name: &str) -> Result<()>;
    fn active_rules(&self) -> Result<Vec<StoredRule>>;
}

pub trait CorrectionStore {
    fn record_correction(
        &mut self,
        file_id: i64,
        corrected_category: &str,
        corrected_by: &str,
    ) -> Result<ManualCorrection>;
    fn latest_correction(&self, file_id: i64) -> Result<Option<ManualCorrection>>;
    fn correction_stats(&self) -> Result<CorrectionStats>;
}

pub struct SqliteRegistry {
    conn: Connection,
}

impl SqliteRegistry {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    pub fn open_with_timeout<P: AsRef<Path>>(path: P, busy_timeout: Duration) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        log::debug!("Registry journal mode: {}", mode);
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn })
    }

    pub fn open_with_config<P: AsRef<Path>>(path: P, config: &EngineConfig) -> Result<Self> {
        Self::open_with_timeout(path, config.db_busy_timeout())
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(Self { conn })
    }

    pub fn conn(&self) -> &Connection {
        &self.conn
    }

    pub fn conn_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }

    pub fn state_history(&self, file_id: i64) -> Result<Vec<StateEvent>> {
        files::state_history(&self.conn, file_id)
    }

    pub fn classification_history(&self, file_id: i64) -> Result<Vec<ClassificationEvent>> {
        corrections::classification_history(&self.conn, file_id)
    }

    pub fn duplicate_links_for(&self, kept_id: i64) -> Result<Vec<DuplicateLink>> {
        duplicates::links_for_kept(&self.conn, kept_id)
    }

    pub fn all_duplicate_links(&self) -> Result<Vec<DuplicateLink>> {
        duplicates::list_links(&self.conn)
    }

    pub fn list_runs(&self) -> Result<Vec<RunRecord>> {
        moves::list_runs(&self.conn)
    }
}

impl Registry for SqliteRegistry {
    fn initialize(&mut self) -> Result<()> {
        schema::initialize_schema(&self.conn)
    }

    fn register_file(&mut self, file: &NewFile) -> Result<FileRecord> {
        files::register_file(&self.conn, file)
    }

    fn get_file(&self, id: i64) -> Result<Option<FileRecord>> {
        files::get_file(&self.conn, id)
    }

    fn get_file_by_path(&self, path: &Path) -> Result<Option<FileRecord>> {
        files::get_file_by_path(&self.conn, path)
    }

    fn update_fingerprints(&mut self, id: i64, quick: &str, full: Option<&str>) -> Result<FileRecord> {
        files::update_fingerprints(&self.conn, id, quick, full)
    }

    fn set_full_fingerprint(&mut self, id: i64, full: &str) -> Result<()> {
        files::set_full_fingerprint(&self.conn, id, full)
    }

    fn find_by_full_fingerprint(&self, digest: &str) -> Result<Vec<FileRecord>> {
        files::find_by_full_fingerprint(&self.conn, digest)
    }

    fn find_by_quick_fingerprint(&self, quick: &str) -> Result<Vec<FileRecord>> {
        files::find_by_quick_fingerprint(&self.conn, quick)
    }

    fn colliding_quick_fingerprints(&self) -> Result<Vec<String>> {
        files::colliding_quick_fingerprints(&self.conn)
    }

    fn shared_full_fingerprints(&self) -> Result<Vec<String>> {
        files::shared_full_fingerprints(&self.conn)
    }

    fn record_classification(
        &mut self,
        id: i64,
        classification: &Classification,
    ) -> Result<ClassificationEvent> {
        corrections::record_classification(&self.conn, id, classification)
    }

    fn update_state(&mut self, id: i64, new_state: CanonicalState, reason: &str) -> Result<()> {
        files::update_state(&self.conn, id, new_state, reason)
    }

    fn mark_duplicate(&mut self, duplicate_id: i64, kept_id: i64) -> Result<DuplicateLink> {
        duplicates::mark_duplicate(&self.conn, duplicate_id, kept_id)
    }

    fn promote_duplicate(&mut self, id: i64, reason: &str) -> Result<()> {
        duplicates::promote_duplicate(&self.conn, id, reason)
    }

    fn set_error(&mut self, id: i64, error: Option<&str>) -> Result<()> {
        files::set_error(&self.conn, id, error)
    }

    fn list_by_state(&self, state: CanonicalState) -> Result<StateCursor<'_>> {
        Ok(StateCursor::new(&self.conn, state))
    }

    fn snapshot(&self) -> Result<SqliteRegistry> {
        let mut conn = Connection::open_in_memory()?;
        Backup::new(&self.conn, &mut conn)?.run_to_completion(256, Duration::ZERO, None)?;
        conn.pragma_update(None, "foreign_keys", true)?;
        Ok(SqliteRegistry { conn })
    }
}

impl MoveLog for SqliteRegistry {
    fn record_move(
        &mut self,
        entry: &NewMove,
        transition: Option<&StateTransition>,
    ) -> Result<MoveRecord> {
        moves::record_move(&self.conn, entry, transition)
    }

    fn get_move(&self, id: i64) -> Result<Option<MoveRecord>> {
        moves::get_move(&self.conn, id)
    }

    fn moves_for_file(&self, file_id: i64) -> Result<Vec<MoveRecord>> {
        moves::moves_for_file(&self.conn, file_id)
    }

    fn latest_move_for_file(&self, file_id: i64) -> Result<Option<MoveRecord>> {
        moves::latest_move_for_file(&self.conn, file_id)
    }

    fn moves_for_run(&self, run_id: i64) -> Result<Vec<MoveRecord>> {
        moves::moves_for_run(&self.conn, run_id)
    }

    fn start_run(&mut self) -> Result<i64> {
        moves::start_run(&self.conn)
    }

    fn finish_run(&mut self, run_id: i64, summary: &serde_json::Value) -> Result<()> {
        moves::finish_run(&self.conn, run_id, summary)
    }
}

impl RuleStore for SqliteRegistry {
    fn add_rule(&mut self, rule: &NewRule) -> Result<StoredRule> {
        rules::add_rule(&self.conn, rule)
    }

    fn retire_rule(&mut self, name: &str) -> Result<()> {
        rules::retire_rule(&self.conn, name)
    }

    fn active_rules(&self) -> Result<Vec<StoredRule>> {
        rules::active_rules(&self.conn)
    }
}

impl CorrectionStore for SqliteRegistry {
    fn record_correction(
        &mut self,
        file_id: i64,
        corrected_category: &str,
        corrected_by: &str,
    ) -> Result<ManualCorrection> {
        corrections::record_correction(&self.conn, file_id, corrected_category, corrected_by)
    }

    fn latest_correction(&self, file_id: i64) -> Result<Option<ManualCorrection>> {
        corrections::latest_correction(&self.conn, file_id)
    }

    fn correction_stats(&self) -> Result<CorrectionStats> {
        corrections::correction_stats(&self.conn)
    }
}

pub(crate) fn now_timestamp() -> String {
    format_timestamp(&Utc::now())
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
pub(crate) fn format_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_timestamp(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

pub(crate) fn parse_column<T>(
    idx: usize,
    value: &str,
    parse: fn(&str) -> Result<T>,
) -> rusqlite::Result<T> {
    parse(value).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
    })
}

pub(crate) fn path_text(path: &Path) -> String {
    path.to_string_lossy().to_string()
}
