use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use factory_backup_core::BACKUP_TYPE_MANUAL;
use factory_backup_daemon::config::{self, Config, DatabaseTarget, RuntimeConfig};
use factory_backup_daemon::{
    build_router, AppState, BackupManager, CronScheduler, LogNotifier, Notifier, WebhookNotifier,
};
use factory_backup_export::{DatabaseExporter, PgDumpExporter, SqliteFileExporter};
use factory_backup_storage::{MetadataStore, PostgresStore, SqliteStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (cfg, mode) = parse_args()?;
    let runtime = RuntimeConfig::from_env(&cfg)?;
    let manager = build_manager(&runtime).await?;

    match mode.as_deref() {
        Some("run-once") => run_once(manager).await,
        Some("reconcile") => reconcile(manager).await,
        Some("serve") | None => run_service(manager, &runtime).await,
        Some(other) => bail!("unknown mode {other:?} (expected serve, run-once or reconcile)"),
    }
}

/// Parse CLI args, returning the loaded config and optional subcommand.
fn parse_args() -> Result<(Config, Option<String>)> {
    let args: Vec<String> = env::args().collect();
    let mut config_path: Option<PathBuf> = None;
    let mut mode: Option<String> = None;
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                if i >= args.len() {
                    bail!("--config requires a path argument");
                }
                config_path = Some(PathBuf::from(&args[i]));
            }
            other => {
                mode = Some(other.to_owned());
            }
        }
        i += 1;
    }

    let cfg = match config_path {
        Some(path) => {
            info!(?path, "loading config file");
            config::load_config(&path)?
        }
        None => Config::default(),
    };

    Ok((cfg, mode))
}

async fn build_manager(runtime: &RuntimeConfig) -> Result<Arc<BackupManager>> {
    let (store, exporter): (Arc<dyn MetadataStore>, Arc<dyn DatabaseExporter>) =
        match &runtime.database {
            DatabaseTarget::SqliteFile(path) => {
                info!(db = %path.display(), "using sqlite database");
                (
                    Arc::new(SqliteStore::new(path.clone())?),
                    Arc::new(SqliteFileExporter::new(path.clone())),
                )
            }
            DatabaseTarget::Postgres(url) => {
                info!("using postgres database");
                (
                    Arc::new(PostgresStore::new(url).await?),
                    Arc::new(PgDumpExporter::new(url.clone())),
                )
            }
        };

    let notifier: Arc<dyn Notifier> = match &runtime.webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    Ok(BackupManager::new(
        runtime.backup.clone(),
        store,
        exporter,
        Arc::new(CronScheduler),
        notifier,
    ))
}

async fn run_once(manager: Arc<BackupManager>) -> Result<()> {
    tokio::fs::create_dir_all(&manager.settings().backup_dir)
        .await
        .context("create backup directory")?;
    let result = manager
        .create_backup(BACKUP_TYPE_MANUAL, Some("command line".to_owned()))
        .await?;
    info!(
        backup_id = result.id,
        file = %result.file_path,
        size = %result.file_size_formatted,
        duration = %result.duration_formatted,
        "backup created"
    );
    Ok(())
}

async fn reconcile(manager: Arc<BackupManager>) -> Result<()> {
    let report = manager.reconcile(false).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn run_service(manager: Arc<BackupManager>, runtime: &RuntimeConfig) -> Result<()> {
    manager.initialize().await?;

    let state = AppState {
        manager: manager.clone(),
        api_token: runtime.api_token.clone(),
    };
    if state.api_token.is_none() {
        warn!("BACKUP_API_TOKEN not set, API is unauthenticated");
    }

    let addr: SocketAddr = runtime
        .listen
        .parse()
        .with_context(|| format!("invalid listen address: {}", runtime.listen))?;
    let app = build_router(state);

    info!(%addr, "starting backup API server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.stop_scheduled_backups();
    info!("backup daemon stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
