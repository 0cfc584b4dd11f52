pub mod backup;
pub mod error;
pub mod format;
pub mod hash;

pub use backup::{
    archive_file_name, backup_name, BackupMetadata, BackupRecord, BackupTotals, DatabaseStats,
    NewBackupRecord, OverallTotals, SystemInfo, TableStat, TypeTotals, ARCHIVE_EXTENSION,
    BACKUP_TYPE_MANUAL, BACKUP_TYPE_SCHEDULED, METADATA_FILE_NAME, UPLOADS_DIR_NAME,
};
pub use error::BackupError;
pub use format::{format_duration, format_file_size};
pub use hash::file_checksum;
