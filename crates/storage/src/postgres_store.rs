use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use factory_backup_core::{BackupRecord, BackupTotals, NewBackupRecord, OverallTotals, TypeTotals};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};

use crate::store::{quote_identifier, MetadataStore};

const SELECT_BACKUP: &str = "SELECT id, filename, file_path, file_size, type, description, duration, checksum, created_at
     FROM backups";

/// Postgres-backed store for deployments running a client/server database.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connect to postgres")?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS backups (
                id BIGSERIAL PRIMARY KEY,
                filename TEXT NOT NULL,
                file_path TEXT NOT NULL,
                file_size BIGINT NOT NULL DEFAULT 0,
                type TEXT NOT NULL DEFAULT 'manual',
                description TEXT,
                duration BIGINT NOT NULL DEFAULT 0,
                checksum TEXT,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .context("create backups table")?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_backups_created_at ON backups (created_at)")
            .execute(&self.pool)
            .await
            .context("create backups index")?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl MetadataStore for PostgresStore {
    async fn insert_backup(&self, record: &NewBackupRecord) -> Result<BackupRecord> {
        let row = sqlx::query(
            "INSERT INTO backups (filename, file_path, file_size, type, description, duration, checksum, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
             RETURNING id",
        )
        .bind(&record.filename)
        .bind(&record.file_path)
        .bind(record.file_size)
        .bind(&record.backup_type)
        .bind(&record.description)
        .bind(record.duration)
        .bind(&record.checksum)
        .bind(record.created_at)
        .fetch_one(&self.pool)
        .await
        .context("insert backup record")?;

        Ok(record.clone().with_id(row.get("id")))
    }

    async fn list_backups(&self, offset: i64, limit: i64) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!(
            "{SELECT_BACKUP} ORDER BY created_at DESC, id DESC LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(pg_row_to_record).collect())
    }

    async fn count_backups(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS total FROM backups")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.get("total"))
    }

    async fn all_backups(&self) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!("{SELECT_BACKUP} ORDER BY created_at DESC, id DESC"))
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(pg_row_to_record).collect())
    }

    async fn get_backup(&self, id: i64) -> Result<Option<BackupRecord>> {
        let row = sqlx::query(&format!("{SELECT_BACKUP} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(pg_row_to_record))
    }

    async fn delete_backup(&self, id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM backups WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("delete backup record")?;
        Ok(result.rows_affected() > 0)
    }

    async fn backups_beyond(&self, keep: i64) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(&format!(
            "{SELECT_BACKUP} ORDER BY created_at DESC, id DESC OFFSET $1"
        ))
        .bind(keep.max(0))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(pg_row_to_record).collect())
    }

    async fn statistics(&self) -> Result<BackupTotals> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total_backups,
                    COALESCE(SUM(file_size), 0)::BIGINT AS total_size,
                    COALESCE(AVG(file_size), 0)::FLOAT8 AS avg_size,
                    COALESCE(AVG(duration), 0)::FLOAT8 AS avg_duration,
                    MAX(created_at) AS latest_backup,
                    MIN(created_at) AS oldest_backup
             FROM backups",
        )
        .fetch_one(&self.pool)
        .await?;

        let overall = OverallTotals {
            total_backups: row.get("total_backups"),
            total_size: row.get("total_size"),
            avg_size: row.get("avg_size"),
            avg_duration: row.get("avg_duration"),
            latest_backup: row.get::<Option<DateTime<Utc>>, _>("latest_backup"),
            oldest_backup: row.get::<Option<DateTime<Utc>>, _>("oldest_backup"),
        };

        let rows = sqlx::query(
            "SELECT type, COUNT(*) AS count,
                    COALESCE(SUM(file_size), 0)::BIGINT AS total_size,
                    COALESCE(AVG(duration), 0)::FLOAT8 AS avg_duration
             FROM backups GROUP BY type ORDER BY type",
        )
        .fetch_all(&self.pool)
        .await?;

        let by_type = rows
            .iter()
            .map(|r| TypeTotals {
                backup_type: r.get("type"),
                count: r.get("count"),
                total_size: r.get("total_size"),
                avg_duration: r.get("avg_duration"),
            })
            .collect();

        Ok(BackupTotals { overall, by_type })
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT tablename FROM pg_catalog.pg_tables
             WHERE schemaname = 'public' ORDER BY tablename",
        )
        .fetch_all(&self.pool)
        .await
        .context("list tables")?;
        Ok(rows.iter().map(|r| r.get("tablename")).collect())
    }

    async fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) AS total FROM {}", quote_identifier(table));
        let row = sqlx::query(&sql)
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("count rows: {sql}"))?;
        Ok(row.get("total"))
    }
}

fn pg_row_to_record(row: &sqlx::postgres::PgRow) -> BackupRecord {
    BackupRecord {
        id: row.get("id"),
        filename: row.get("filename"),
        file_path: row.get("file_path"),
        file_size: row.get("file_size"),
        backup_type: row.get("type"),
        description: row.get("description"),
        duration: row.get("duration"),
        checksum: row.get("checksum"),
        created_at: row.get("created_at"),
    }
}
