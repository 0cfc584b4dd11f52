use thiserror::Error;

/// Conditions callers branch on. Everything else travels as `anyhow::Error`.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("a backup is already running")]
    AlreadyRunning,
    #[error("backup {0} not found")]
    NotFound(i64),
    #[error("invalid cron expression {expr:?}: {reason}")]
    InvalidSchedule { expr: String, reason: String },
    #[error("unknown time zone {0:?}")]
    UnknownTimeZone(String),
    #[error("backup archive is missing: {0}")]
    ArchiveMissing(String),
}
