use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::manager::{validate_schedule, BackupSettings};

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub backup: BackupConfig,
    pub database: DatabaseConfig,
    pub uploads: UploadsConfig,
    pub security: SecurityConfig,
    pub notify: NotifyConfig,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct BackupConfig {
    pub dir: Option<String>,
    pub max_backups: Option<i64>,
    pub schedule: Option<String>,
    pub timezone: Option<String>,
    pub enabled: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct UploadsConfig {
    pub dir: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SecurityConfig {
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("reading config file {path:?}"))?;
    toml::from_str(&contents).with_context(|| format!("parsing config file {path:?}"))
}

pub const DEFAULT_BACKUP_DIR: &str = "./backups";
pub const DEFAULT_MAX_BACKUPS: i64 = 10;
pub const DEFAULT_SCHEDULE: &str = "0 2 * * *";
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_DB_PATH: &str = "./data/factory.db";
pub const DEFAULT_UPLOADS_DIR: &str = "./uploads";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:8089";

/// Where the live database lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseTarget {
    SqliteFile(PathBuf),
    Postgres(String),
}

/// Fully resolved settings: environment first, then the config file, then defaults.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub backup: BackupSettings,
    pub database: DatabaseTarget,
    pub api_token: Option<String>,
    pub webhook_url: Option<String>,
}

impl RuntimeConfig {
    pub fn from_env(cfg: &Config) -> Result<Self> {
        Self::resolve(cfg, |key| std::env::var(key).ok())
    }

    pub fn resolve(cfg: &Config, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let max_backups = match env("BACKUP_MAX_COUNT") {
            Some(raw) => raw
                .trim()
                .parse::<i64>()
                .with_context(|| format!("BACKUP_MAX_COUNT is not an integer: {raw:?}"))?,
            None => cfg.backup.max_backups.unwrap_or(DEFAULT_MAX_BACKUPS),
        };
        if max_backups < 1 {
            bail!("max_backups must be at least 1, got {max_backups}");
        }

        let schedule_enabled = match env("BACKUP_ENABLED") {
            Some(raw) => parse_bool(&raw)
                .with_context(|| format!("BACKUP_ENABLED is not a boolean: {raw:?}"))?,
            None => cfg.backup.enabled.unwrap_or(true),
        };

        let backup = BackupSettings {
            backup_dir: PathBuf::from(
                env("BACKUP_DIR")
                    .or_else(|| cfg.backup.dir.clone())
                    .unwrap_or_else(|| DEFAULT_BACKUP_DIR.to_owned()),
            ),
            uploads_dir: PathBuf::from(
                env("UPLOADS_DIR")
                    .or_else(|| cfg.uploads.dir.clone())
                    .unwrap_or_else(|| DEFAULT_UPLOADS_DIR.to_owned()),
            ),
            max_backups,
            schedule: env("BACKUP_SCHEDULE")
                .or_else(|| cfg.backup.schedule.clone())
                .unwrap_or_else(|| DEFAULT_SCHEDULE.to_owned()),
            timezone: env("BACKUP_TIMEZONE")
                .or_else(|| cfg.backup.timezone.clone())
                .unwrap_or_else(|| DEFAULT_TIMEZONE.to_owned()),
            schedule_enabled,
        };
        if backup.schedule_enabled {
            validate_schedule(&backup.schedule, &backup.timezone).with_context(|| {
                format!(
                    "invalid backup schedule {:?} in {}",
                    backup.schedule, backup.timezone
                )
            })?;
        }

        let database = match env("DATABASE_URL").or_else(|| cfg.database.url.clone()) {
            Some(url) if url.starts_with("postgres://") || url.starts_with("postgresql://") => {
                DatabaseTarget::Postgres(url)
            }
            Some(url) => bail!("unsupported DATABASE_URL scheme: {url}"),
            None => DatabaseTarget::SqliteFile(PathBuf::from(
                env("DB_PATH")
                    .or_else(|| cfg.database.path.clone())
                    .unwrap_or_else(|| DEFAULT_DB_PATH.to_owned()),
            )),
        };

        Ok(Self {
            listen: env("BACKUP_LISTEN")
                .or_else(|| cfg.server.listen.clone())
                .unwrap_or_else(|| DEFAULT_LISTEN.to_owned()),
            backup,
            database,
            api_token: env("BACKUP_API_TOKEN").or_else(|| cfg.security.api_token.clone()),
            webhook_url: env("BACKUP_WEBHOOK_URL").or_else(|| cfg.notify.webhook_url.clone()),
        })
    }
}

fn parse_bool(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("expected true/false, got {other:?}"),
    }
}
