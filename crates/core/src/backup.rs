use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// Tag stored on backups started by the recurring schedule.
pub const BACKUP_TYPE_SCHEDULED: &str = "scheduled";
/// Tag stored on backups started on demand.
pub const BACKUP_TYPE_MANUAL: &str = "manual";

/// File name of the metadata document written inside every archive.
pub const METADATA_FILE_NAME: &str = "backup_metadata.json";
/// Directory inside the archive holding the copy of the uploads tree.
pub const UPLOADS_DIR_NAME: &str = "uploads";
/// Extension of produced archives (tar stream, zstd compressed).
pub const ARCHIVE_EXTENSION: &str = "tar.zst";

/// One completed backup, as persisted in the `backups` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRecord {
    pub id: i64,
    pub filename: String,
    pub file_path: String,
    pub file_size: i64,
    #[serde(rename = "type")]
    pub backup_type: String,
    pub description: Option<String>,
    /// Milliseconds spent producing the archive.
    pub duration: i64,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewBackupRecord {
    pub filename: String,
    pub file_path: String,
    pub file_size: i64,
    pub backup_type: String,
    pub description: Option<String>,
    pub duration: i64,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewBackupRecord {
    pub fn with_id(self, id: i64) -> BackupRecord {
        BackupRecord {
            id,
            filename: self.filename,
            file_path: self.file_path,
            file_size: self.file_size,
            backup_type: self.backup_type,
            description: self.description,
            duration: self.duration,
            checksum: self.checksum,
            created_at: self.created_at,
        }
    }
}

/// Filesystem-safe, timestamp-derived name for one run, e.g.
/// `backup_2026-02-13T01-00-00-123Z`.
pub fn backup_name(now: DateTime<Utc>) -> String {
    let stamp = now
        .to_rfc3339_opts(SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("backup_{stamp}")
}

pub fn archive_file_name(backup_name: &str) -> String {
    format!("{backup_name}.{ARCHIVE_EXTENSION}")
}

/// Document written as `backup_metadata.json` inside each archive.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupMetadata {
    pub backup_name: String,
    pub backup_type: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub database_file: String,
    pub database_engine: String,
    pub includes_files: bool,
    pub system_info: SystemInfo,
    pub database_stats: DatabaseStats,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SystemInfo {
    pub platform: String,
    pub arch: String,
    pub app_version: String,
}

impl SystemInfo {
    pub fn current(app_version: &str) -> Self {
        Self {
            platform: std::env::consts::OS.to_owned(),
            arch: std::env::consts::ARCH.to_owned(),
            app_version: app_version.to_owned(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableStat {
    pub name: String,
    pub records: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DatabaseStats {
    pub table_count: i64,
    pub tables: Vec<TableStat>,
    pub total_records: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DatabaseStats {
    pub fn from_tables(tables: Vec<TableStat>) -> Self {
        Self {
            table_count: tables.len() as i64,
            total_records: tables.iter().map(|t| t.records).sum(),
            tables,
            error: None,
        }
    }

    /// Statistics collection failed; the backup still proceeds with zeroed counts.
    pub fn degraded(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Aggregates over every stored backup.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OverallTotals {
    pub total_backups: i64,
    pub total_size: i64,
    pub avg_size: f64,
    pub avg_duration: f64,
    pub latest_backup: Option<DateTime<Utc>>,
    pub oldest_backup: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TypeTotals {
    #[serde(rename = "type")]
    pub backup_type: String,
    pub count: i64,
    pub total_size: i64,
    pub avg_duration: f64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct BackupTotals {
    pub overall: OverallTotals,
    pub by_type: Vec<TypeTotals>,
}
