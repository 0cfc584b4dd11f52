use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// A point-in-time copy of the live database, written into a scratch directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSnapshot {
    /// File name relative to the scratch directory.
    pub file_name: String,
    pub size: u64,
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("database file does not exist: {0}")]
    MissingDatabase(PathBuf),
    #[error("dump command failed ({status}): {stderr}")]
    DumpFailed { status: String, stderr: String },
}

/// Produces a restorable snapshot of the live database. One implementation per engine,
/// selected from configuration.
#[async_trait::async_trait]
pub trait DatabaseExporter: Send + Sync {
    fn engine(&self) -> &'static str;

    async fn export(&self, dest_dir: &Path) -> Result<DatabaseSnapshot>;
}

/// Copies a single-file embedded database as-is.
#[derive(Debug, Clone)]
pub struct SqliteFileExporter {
    db_path: PathBuf,
}

impl SqliteFileExporter {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
        }
    }
}

#[async_trait::async_trait]
impl DatabaseExporter for SqliteFileExporter {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    async fn export(&self, dest_dir: &Path) -> Result<DatabaseSnapshot> {
        if !tokio::fs::try_exists(&self.db_path).await.unwrap_or(false) {
            return Err(ExportError::MissingDatabase(self.db_path.clone()).into());
        }

        let file_name = self
            .db_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "database.db".to_owned());
        let dest = dest_dir.join(&file_name);

        let size = tokio::fs::copy(&self.db_path, &dest).await.with_context(|| {
            format!(
                "copy database {} to {}",
                self.db_path.display(),
                dest.display()
            )
        })?;
        debug!(file = %file_name, size, "database file copied");

        Ok(DatabaseSnapshot { file_name, size })
    }
}

/// Runs `pg_dump` to produce a plain SQL snapshot of a Postgres database.
#[derive(Debug, Clone)]
pub struct PgDumpExporter {
    database_url: String,
    program: String,
}

impl PgDumpExporter {
    pub const DUMP_FILE_NAME: &'static str = "database.sql";

    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            program: "pg_dump".to_owned(),
        }
    }

    /// Override the dump binary, e.g. a versioned `pg_dump-16`.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }
}

#[async_trait::async_trait]
impl DatabaseExporter for PgDumpExporter {
    fn engine(&self) -> &'static str {
        "postgres"
    }

    async fn export(&self, dest_dir: &Path) -> Result<DatabaseSnapshot> {
        let start = Instant::now();
        let dest = dest_dir.join(Self::DUMP_FILE_NAME);

        let out = Command::new(&self.program)
            .arg("--no-owner")
            .arg("--no-privileges")
            .arg("--file")
            .arg(&dest)
            .arg("--dbname")
            .arg(&self.database_url)
            .output()
            .await
            .with_context(|| format!("failed to run {}", self.program))?;

        if !out.status.success() {
            return Err(ExportError::DumpFailed {
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_owned(),
            }
            .into());
        }

        let size = tokio::fs::metadata(&dest)
            .await
            .map_err(|e| anyhow!("dump file missing after {}: {e}", self.program))?
            .len();
        info!(size, elapsed_ms = start.elapsed().as_millis() as u64, "pg_dump finished");

        Ok(DatabaseSnapshot {
            file_name: Self::DUMP_FILE_NAME.to_owned(),
            size,
        })
    }
}
