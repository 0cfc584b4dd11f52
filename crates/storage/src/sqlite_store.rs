use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use factory_backup_core::{BackupRecord, BackupTotals, NewBackupRecord, OverallTotals, TypeTotals};
use rusqlite::{params, Connection, OptionalExtension};

use crate::store::{quote_identifier, MetadataStore};

const SELECT_BACKUP: &str = "SELECT id, filename, file_path, file_size, type, description, duration, checksum, created_at
     FROM backups";

/// SQLite-backed store living inside the application's own database file.
/// Each method opens a fresh connection on the blocking pool.
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    pub fn new(db_path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            db_path: db_path.into(),
        };
        store.init_db()?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_db(&self) -> Result<()> {
        if let Some(parent) = self.db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database directory {}", parent.display()))?;
        }
        let conn = open(&self.db_path)?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS backups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                filename TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size INTEGER NOT NULL DEFAULT 0,
                type TEXT NOT NULL DEFAULT 'manual',
                description TEXT,
                duration INTEGER NOT NULL DEFAULT 0,
                checksum TEXT,
                created_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_backups_created_at ON backups (created_at);",
        )
        .context("create backups table")?;
        Ok(())
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let conn = open(&db_path)?;
            f(&conn)
        })
        .await?
    }
}

fn open(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("open sqlite database {}", path.display()))?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(conn)
}

#[async_trait::async_trait]
impl MetadataStore for SqliteStore {
    async fn insert_backup(&self, record: &NewBackupRecord) -> Result<BackupRecord> {
        let record = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO backups (filename, file_path, file_size, type, description, duration, checksum, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    record.filename,
                    record.file_path,
                    record.file_size,
                    record.backup_type,
                    record.description,
                    record.duration,
                    record.checksum,
                    format_ts(record.created_at),
                ],
            )
            .context("insert backup record")?;
            Ok(record.with_id(conn.last_insert_rowid()))
        })
        .await
    }

    async fn list_backups(&self, offset: i64, limit: i64) -> Result<Vec<BackupRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_BACKUP} ORDER BY created_at DESC, id DESC LIMIT ?1 OFFSET ?2"
            ))?;
            let rows = stmt.query_map(params![limit, offset], row_to_record)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    async fn count_backups(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row("SELECT COUNT(*) FROM backups", [], |r| r.get(0))?;
            Ok(count)
        })
        .await
    }

    async fn all_backups(&self) -> Result<Vec<BackupRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("{SELECT_BACKUP} ORDER BY created_at DESC, id DESC"))?;
            let rows = stmt.query_map([], row_to_record)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    async fn get_backup(&self, id: i64) -> Result<Option<BackupRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!("{SELECT_BACKUP} WHERE id = ?1"))?;
            let found = stmt.query_row([id], row_to_record).optional()?;
            Ok(found)
        })
        .await
    }

    async fn delete_backup(&self, id: i64) -> Result<bool> {
        self.with_conn(move |conn| {
            let changed = conn
                .execute("DELETE FROM backups WHERE id = ?1", [id])
                .context("delete backup record")?;
            Ok(changed > 0)
        })
        .await
    }

    async fn backups_beyond(&self, keep: i64) -> Result<Vec<BackupRecord>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "{SELECT_BACKUP} ORDER BY created_at DESC, id DESC LIMIT -1 OFFSET ?1"
            ))?;
            let rows = stmt.query_map([keep.max(0)], row_to_record)?;
            rows.collect::<std::result::Result<Vec<_>, _>>().map_err(Into::into)
        })
        .await
    }

    async fn statistics(&self) -> Result<BackupTotals> {
        self.with_conn(|conn| {
            let overall = conn.query_row(
                "SELECT COUNT(*), COALESCE(SUM(file_size), 0), COALESCE(AVG(file_size), 0.0),
                        COALESCE(AVG(duration), 0.0), MAX(created_at), MIN(created_at)
                 FROM backups",
                [],
                |r| {
                    Ok(OverallTotals {
                        total_backups: r.get(0)?,
                        total_size: r.get(1)?,
                        avg_size: r.get(2)?,
                        avg_duration: r.get(3)?,
                        latest_backup: r.get::<_, Option<String>>(4)?.map(parse_ts).transpose()?,
                        oldest_backup: r.get::<_, Option<String>>(5)?.map(parse_ts).transpose()?,
                    })
                },
            )?;

            let mut stmt = conn.prepare(
                "SELECT type, COUNT(*), COALESCE(SUM(file_size), 0), COALESCE(AVG(duration), 0.0)
                 FROM backups GROUP BY type ORDER BY type",
            )?;
            let by_type = stmt
                .query_map([], |r| {
                    Ok(TypeTotals {
                        backup_type: r.get(0)?,
                        count: r.get(1)?,
                        total_size: r.get(2)?,
                        avg_duration: r.get(3)?,
                    })
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;

            Ok(BackupTotals { overall, by_type })
        })
        .await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT name FROM sqlite_master
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%'
                 ORDER BY name",
            )?;
            let names = stmt
                .query_map([], |r| r.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(names)
        })
        .await
    }

    async fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {}", quote_identifier(table));
        self.with_conn(move |conn| {
            let count = conn
                .query_row(&sql, [], |r| r.get(0))
                .with_context(|| format!("count rows: {sql}"))?;
            Ok(count)
        })
        .await
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<BackupRecord> {
    Ok(BackupRecord {
        id: row.get(0)?,
        filename: row.get(1)?,
        file_path: row.get(2)?,
        file_size: row.get(3)?,
        backup_type: row.get(4)?,
        description: row.get(5)?,
        duration: row.get(6)?,
        checksum: row.get(7)?,
        created_at: parse_ts(row.get::<_, String>(8)?)?,
    })
}

/// Fixed-width UTC timestamps so that text ordering matches time ordering.
fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}
