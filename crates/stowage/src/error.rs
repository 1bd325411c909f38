use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StowageError {
    #[error("Registry transaction error: {0}")]
    Registry(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("File record not found: {0}")]
    RecordNotFound(i64),

    #[error("Move record not found: {0}")]
    MoveNotFound(i64),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Records {kept} and {duplicate} do not share a full fingerprint")]
    FingerprintMismatch { kept: i64, duplicate: i64 },

    #[error("Backup verification failed for {path}: expected {expected}, got {actual}")]
    BackupVerificationFailed {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Move failed for {path}: {reason}")]
    MoveFailed { path: PathBuf, reason: String },

    #[error("Source file changed: expected hash {expected}, current hash {actual}")]
    SourceChanged { expected: String, actual: String },

    #[error("Classification degraded: {0}")]
    ClassificationDegraded(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Rollback refused: {0}")]
    RollbackRefused(String),

    #[error("Insufficient space: {available} bytes available, {required} bytes required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("Operation timed out after {seconds}s: {operation}")]
    Timeout { operation: String, seconds: u64 },

    #[error("Run cancelled")]
    Cancelled,
}

impl StowageError {
    /// Errors that come from the filesystem rather than from the Registry or
    /// the engine's own checks.
    pub fn is_io(&self) -> bool {
        matches!(self, StowageError::Io(_) | StowageError::FileNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, StowageError>;
