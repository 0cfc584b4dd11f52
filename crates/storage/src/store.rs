use anyhow::Result;
use factory_backup_core::{BackupRecord, BackupTotals, NewBackupRecord};

/// Backup-record persistence plus the catalog queries used for archive metadata.
/// Implemented by both the SQLite and Postgres backends.
#[async_trait::async_trait]
pub trait MetadataStore: Send + Sync {
    /// Insert a completed backup; the store assigns the id.
    async fn insert_backup(&self, record: &NewBackupRecord) -> Result<BackupRecord>;

    /// One page of backups ordered by created_at DESC.
    async fn list_backups(&self, offset: i64, limit: i64) -> Result<Vec<BackupRecord>>;

    async fn count_backups(&self) -> Result<i64>;

    async fn all_backups(&self) -> Result<Vec<BackupRecord>>;

    async fn get_backup(&self, id: i64) -> Result<Option<BackupRecord>>;

    /// Returns false when no row matched.
    async fn delete_backup(&self, id: i64) -> Result<bool>;

    /// Every backup after the `keep` newest, newest first.
    async fn backups_beyond(&self, keep: i64) -> Result<Vec<BackupRecord>>;

    async fn statistics(&self) -> Result<BackupTotals>;

    /// Names of user-defined tables in the live database.
    async fn list_tables(&self) -> Result<Vec<String>>;

    async fn count_rows(&self, table: &str) -> Result<i64>;
}

/// Double-quotes a table name for interpolation into a COUNT query.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}
