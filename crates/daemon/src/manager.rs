use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use factory_backup_core::{
    archive_file_name, backup_name, file_checksum, format_duration, format_file_size,
    BackupError, BackupMetadata, BackupRecord, DatabaseStats, NewBackupRecord, OverallTotals,
    SystemInfo, TableStat, TypeTotals, ARCHIVE_EXTENSION, BACKUP_TYPE_SCHEDULED,
    METADATA_FILE_NAME, UPLOADS_DIR_NAME,
};
use factory_backup_export::{
    copy_dir_recursive, extract_archive, list_entries, path_exists, read_entry,
    remove_dir_best_effort, remove_file_if_exists, write_archive, DatabaseExporter,
};
use factory_backup_storage::MetadataStore;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::notify::{Notifier, ADMIN_ROLE, EVENT_BACKUP_COMPLETED, EVENT_BACKUP_FAILED};
use crate::scheduler::{CronSchedule, Job, JobFuture, ScheduledJob, Scheduler};

const APP_VERSION: &str = env!("CARGO_PKG_VERSION");
const SCRATCH_PREFIX: &str = "temp_";
const MAX_PAGE_SIZE: i64 = 100;

#[derive(Debug, Clone)]
pub struct BackupSettings {
    pub backup_dir: PathBuf,
    pub uploads_dir: PathBuf,
    /// Number of most recent backups kept by retention pruning.
    pub max_backups: i64,
    pub schedule: String,
    pub timezone: String,
    pub schedule_enabled: bool,
}

/// Summary returned by a successful `create_backup`.
#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub id: i64,
    pub filename: String,
    pub file_path: String,
    pub file_size: i64,
    pub file_size_formatted: String,
    #[serde(rename = "type")]
    pub backup_type: String,
    pub description: Option<String>,
    pub duration: i64,
    pub duration_formatted: String,
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<BackupRecord> for BackupResult {
    fn from(r: BackupRecord) -> Self {
        Self {
            file_size_formatted: format_file_size(r.file_size),
            duration_formatted: format_duration(r.duration),
            id: r.id,
            filename: r.filename,
            file_path: r.file_path,
            file_size: r.file_size,
            backup_type: r.backup_type,
            description: r.description,
            duration: r.duration,
            checksum: r.checksum,
            created_at: r.created_at,
        }
    }
}

/// A stored record annotated for display, with a live check of the archive on disk.
#[derive(Debug, Clone, Serialize)]
pub struct BackupView {
    #[serde(flatten)]
    pub record: BackupRecord,
    pub file_size_formatted: String,
    pub duration_formatted: String,
    pub file_exists: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub pages: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupPage {
    pub backups: Vec<BackupView>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub cron: String,
    pub timezone: String,
    pub next_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupStatistics {
    pub overall: OverallTotals,
    pub total_size_formatted: String,
    pub by_type: Vec<TypeTotals>,
    pub schedule: ScheduleStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerStatus {
    pub is_running: bool,
    pub scheduled_enabled: bool,
    pub schedule: String,
    pub timezone: String,
    pub backup_dir: String,
    pub max_backups: i64,
    pub next_scheduled_run: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub id: i64,
    pub file_exists: bool,
    /// `None` when the record carries no checksum.
    pub checksum_match: Option<bool>,
    pub entry_count: usize,
    pub has_metadata: bool,
    pub valid: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrphanReport {
    /// Archives in the backup directory with no matching record.
    pub orphan_archives: Vec<String>,
    /// Scratch directories and partial archives left by interrupted runs.
    pub orphan_scratch: Vec<String>,
    /// Records whose archive is gone from disk.
    pub missing_files: Vec<i64>,
    pub removed: usize,
}

/// Holds the process-wide "backup running" flag; released on drop so that no error
/// path can leave it set.
struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self { flag })
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Orchestrates database + uploads exports into versioned archives, tracks them in the
/// `backups` table and prunes beyond the retention count.
pub struct BackupManager {
    settings: BackupSettings,
    store: Arc<dyn MetadataStore>,
    exporter: Arc<dyn DatabaseExporter>,
    scheduler: Arc<dyn Scheduler>,
    notifier: Arc<dyn Notifier>,
    running: AtomicBool,
    scheduled_job: Mutex<Option<Box<dyn ScheduledJob>>>,
}

impl BackupManager {
    pub fn new(
        settings: BackupSettings,
        store: Arc<dyn MetadataStore>,
        exporter: Arc<dyn DatabaseExporter>,
        scheduler: Arc<dyn Scheduler>,
        notifier: Arc<dyn Notifier>,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            store,
            exporter,
            scheduler,
            notifier,
            running: AtomicBool::new(false),
            scheduled_job: Mutex::new(None),
        })
    }

    pub fn settings(&self) -> &BackupSettings {
        &self.settings
    }

    /// Ensures the backup directory exists and starts the recurring trigger when enabled.
    pub async fn initialize(self: &Arc<Self>) -> Result<()> {
        tokio::fs::create_dir_all(&self.settings.backup_dir)
            .await
            .with_context(|| {
                format!(
                    "create backup directory {}",
                    self.settings.backup_dir.display()
                )
            })?;

        if self.settings.schedule_enabled {
            self.start_scheduled_backups()?;
        } else {
            info!("scheduled backups disabled");
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn create_backup(
        &self,
        backup_type: &str,
        description: Option<String>,
    ) -> Result<BackupResult> {
        let _guard = RunGuard::acquire(&self.running).ok_or(BackupError::AlreadyRunning)?;

        let started = Instant::now();
        let name = backup_name(Utc::now());
        info!(backup_name = %name, backup_type, "starting backup");

        match self.run_pipeline(&name, backup_type, description, started).await {
            Ok(result) => {
                info!(
                    backup_id = result.id,
                    backup_name = %name,
                    size = %result.file_size_formatted,
                    duration = %result.duration_formatted,
                    "backup completed"
                );
                Ok(result)
            }
            Err(e) => {
                error!(backup_name = %name, error = %format!("{e:#}"), "backup failed");
                Err(e)
            }
        }
    }

    async fn run_pipeline(
        &self,
        name: &str,
        backup_type: &str,
        description: Option<String>,
        started: Instant,
    ) -> Result<BackupResult> {
        let scratch = self
            .settings
            .backup_dir
            .join(format!("{SCRATCH_PREFIX}{name}"));
        tokio::fs::create_dir_all(&scratch)
            .await
            .with_context(|| format!("create scratch directory {}", scratch.display()))?;

        let (snapshot, includes_files) = tokio::try_join!(
            async {
                self.exporter
                    .export(&scratch)
                    .await
                    .context("export database")
            },
            self.export_uploads(&scratch),
        )?;

        let metadata = BackupMetadata {
            backup_name: name.to_owned(),
            backup_type: backup_type.to_owned(),
            description: description.clone(),
            created_at: Utc::now(),
            database_file: snapshot.file_name,
            database_engine: self.exporter.engine().to_owned(),
            includes_files,
            system_info: SystemInfo::current(APP_VERSION),
            database_stats: self.collect_database_stats().await,
        };
        let metadata_path = scratch.join(METADATA_FILE_NAME);
        let raw = serde_json::to_vec_pretty(&metadata).context("serialize backup metadata")?;
        tokio::fs::write(&metadata_path, raw)
            .await
            .with_context(|| format!("write {}", metadata_path.display()))?;

        let filename = archive_file_name(name);
        let archive_path = self.settings.backup_dir.join(&filename);
        let file_size = write_archive(&scratch, &archive_path)
            .await
            .context("write backup archive")?;
        let checksum = self.checksum(&archive_path).await;

        if !remove_dir_best_effort(&scratch).await {
            warn!(scratch = %scratch.display(), "scratch directory left behind");
        }

        let record = self
            .store
            .insert_backup(&NewBackupRecord {
                filename,
                file_path: archive_path.to_string_lossy().into_owned(),
                file_size: file_size as i64,
                backup_type: backup_type.to_owned(),
                description,
                duration: started.elapsed().as_millis() as i64,
                checksum,
                created_at: Utc::now(),
            })
            .await
            .context("persist backup record")?;

        if let Err(e) = self.cleanup_old_backups().await {
            warn!(error = %format!("{e:#}"), "retention pruning failed");
        }

        Ok(record.into())
    }

    async fn export_uploads(&self, scratch: &Path) -> Result<bool> {
        let uploads = &self.settings.uploads_dir;
        if !path_exists(uploads).await {
            info!(uploads = %uploads.display(), "uploads directory missing, skipping files");
            return Ok(false);
        }
        let summary = copy_dir_recursive(uploads, &scratch.join(UPLOADS_DIR_NAME))
            .await
            .context("export uploads")?;
        debug!(files = summary.files, bytes = summary.bytes, "uploads copied");
        Ok(true)
    }

    async fn collect_database_stats(&self) -> DatabaseStats {
        match self.try_collect_database_stats().await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "collecting database statistics failed");
                DatabaseStats::degraded(format!("{e:#}"))
            }
        }
    }

    async fn try_collect_database_stats(&self) -> Result<DatabaseStats> {
        let names = self.store.list_tables().await.context("list tables")?;
        let mut tables = Vec::with_capacity(names.len());
        for name in names {
            let records = self.store.count_rows(&name).await?;
            tables.push(TableStat { name, records });
        }
        Ok(DatabaseStats::from_tables(tables))
    }

    async fn checksum(&self, archive: &Path) -> Option<String> {
        let path = archive.to_path_buf();
        match tokio::task::spawn_blocking(move || file_checksum(&path)).await {
            Ok(Ok(sum)) => Some(sum),
            Ok(Err(e)) => {
                warn!(error = %format!("{e:#}"), "archive checksum failed");
                None
            }
            Err(e) => {
                warn!(error = %e, "archive checksum task failed");
                None
            }
        }
    }

    /// Deletes every backup beyond the `max_backups` newest. Per-item failures are logged
    /// and skipped. Returns the number of records removed.
    pub async fn cleanup_old_backups(&self) -> Result<usize> {
        let doomed = self
            .store
            .backups_beyond(self.settings.max_backups)
            .await
            .context("select backups beyond retention")?;

        let mut removed = 0;
        for record in doomed {
            match remove_file_if_exists(Path::new(&record.file_path)).await {
                Ok(true) => debug!(backup_id = record.id, file = %record.file_path, "archive removed"),
                Ok(false) => warn!(backup_id = record.id, file = %record.file_path, "archive already missing"),
                Err(e) => warn!(backup_id = record.id, error = %format!("{e:#}"), "archive removal failed"),
            }
            match self.store.delete_backup(record.id).await {
                Ok(_) => removed += 1,
                Err(e) => {
                    warn!(backup_id = record.id, error = %format!("{e:#}"), "backup record removal failed")
                }
            }
        }

        if removed > 0 {
            info!(removed, max_backups = self.settings.max_backups, "old backups pruned");
        }
        Ok(removed)
    }

    pub async fn get_backup_list(&self, page: i64, limit: i64) -> Result<BackupPage> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let total = self.store.count_backups().await?;
        let records = self.store.list_backups((page - 1) * limit, limit).await?;

        let mut backups = Vec::with_capacity(records.len());
        for record in records {
            backups.push(view(record).await);
        }

        Ok(BackupPage {
            backups,
            pagination: Pagination {
                page,
                limit,
                total,
                pages: (total + limit - 1) / limit,
            },
        })
    }

    pub async fn get_backup_by_id(&self, id: i64) -> Result<Option<BackupView>> {
        match self.store.get_backup(id).await? {
            Some(record) => Ok(Some(view(record).await)),
            None => Ok(None),
        }
    }

    /// Removes the archive (best effort) and then always the record.
    pub async fn delete_backup(&self, id: i64) -> Result<()> {
        let record = self
            .store
            .get_backup(id)
            .await?
            .ok_or(BackupError::NotFound(id))?;

        match remove_file_if_exists(Path::new(&record.file_path)).await {
            Ok(true) => {}
            Ok(false) => warn!(backup_id = id, file = %record.file_path, "archive already missing"),
            Err(e) => warn!(backup_id = id, error = %format!("{e:#}"), "archive removal failed"),
        }

        self.store
            .delete_backup(id)
            .await
            .context("delete backup record")?;
        info!(backup_id = id, "backup deleted");
        Ok(())
    }

    pub async fn get_backup_statistics(&self) -> Result<BackupStatistics> {
        let totals = self.store.statistics().await?;
        Ok(BackupStatistics {
            total_size_formatted: format_file_size(totals.overall.total_size),
            overall: totals.overall,
            by_type: totals.by_type,
            schedule: ScheduleStatus {
                enabled: self.schedule_active(),
                cron: self.settings.schedule.clone(),
                timezone: self.settings.timezone.clone(),
                next_run: self.next_scheduled_run(),
            },
        })
    }

    pub fn get_status(&self) -> ManagerStatus {
        ManagerStatus {
            is_running: self.is_running(),
            scheduled_enabled: self.schedule_active(),
            schedule: self.settings.schedule.clone(),
            timezone: self.settings.timezone.clone(),
            backup_dir: self.settings.backup_dir.to_string_lossy().into_owned(),
            max_backups: self.settings.max_backups,
            next_scheduled_run: self.next_scheduled_run(),
        }
    }

    /// Registers the recurring trigger, replacing any previous one.
    pub fn start_scheduled_backups(self: &Arc<Self>) -> Result<()> {
        let mut slot = self.job_slot();
        if let Some(previous) = slot.take() {
            previous.cancel();
            debug!(schedule = %previous.expression(), "previous backup schedule cancelled");
        }

        let manager = Arc::downgrade(self);
        let job: Job = Arc::new(move || -> JobFuture {
            let manager = manager.clone();
            Box::pin(async move {
                if let Some(manager) = manager.upgrade() {
                    manager.run_scheduled_backup().await;
                }
            })
        });

        let handle =
            self.scheduler
                .schedule(&self.settings.schedule, &self.settings.timezone, job)?;
        info!(
            schedule = %self.settings.schedule,
            timezone = %self.settings.timezone,
            next_run = ?handle.next_fire_time(),
            "scheduled backups started"
        );
        *slot = Some(handle);
        Ok(())
    }

    pub fn stop_scheduled_backups(&self) {
        if let Some(job) = self.job_slot().take() {
            job.cancel();
            info!("scheduled backups stopped");
        }
    }

    /// Body of each scheduled fire: no retry, the next attempt is the next cron tick.
    pub async fn run_scheduled_backup(&self) {
        match self.create_backup(BACKUP_TYPE_SCHEDULED, None).await {
            Ok(result) => {
                self.notifier
                    .notify_role(
                        ADMIN_ROLE,
                        EVENT_BACKUP_COMPLETED,
                        json!({
                            "id": result.id,
                            "filename": result.filename,
                            "size": result.file_size_formatted,
                            "duration": result.duration_formatted,
                            "type": result.backup_type,
                        }),
                    )
                    .await;
            }
            Err(e) => {
                error!(error = %format!("{e:#}"), "scheduled backup failed");
                self.notifier
                    .notify_role(
                        ADMIN_ROLE,
                        EVENT_BACKUP_FAILED,
                        json!({
                            "priority": "high",
                            "type": BACKUP_TYPE_SCHEDULED,
                            "error": format!("{e:#}"),
                            "timestamp": Utc::now(),
                        }),
                    )
                    .await;
            }
        }
    }

    /// Checks that the archive exists, matches its checksum and reads cleanly.
    pub async fn verify_backup(&self, id: i64) -> Result<VerifyReport> {
        let record = self
            .store
            .get_backup(id)
            .await?
            .ok_or(BackupError::NotFound(id))?;
        let path = PathBuf::from(&record.file_path);

        let mut report = VerifyReport {
            id,
            file_exists: path_exists(&path).await,
            checksum_match: None,
            entry_count: 0,
            has_metadata: false,
            valid: false,
            error: None,
        };
        if !report.file_exists {
            report.error = Some(BackupError::ArchiveMissing(record.file_path).to_string());
            return Ok(report);
        }

        if let Some(expected) = &record.checksum {
            report.checksum_match = self.checksum(&path).await.map(|actual| &actual == expected);
        }

        match list_entries(&path).await {
            Ok(entries) => {
                report.entry_count = entries.len();
                report.has_metadata = entries.iter().any(|e| e == METADATA_FILE_NAME);
            }
            Err(e) => report.error = Some(format!("{e:#}")),
        }

        report.valid = report.error.is_none()
            && report.has_metadata
            && report.checksum_match.unwrap_or(true);
        Ok(report)
    }

    /// Unpacks a backup into `target_dir` (which must be empty or absent) and returns its
    /// metadata. The live database is left untouched.
    pub async fn restore_backup(&self, id: i64, target_dir: &Path) -> Result<BackupMetadata> {
        let record = self
            .store
            .get_backup(id)
            .await?
            .ok_or(BackupError::NotFound(id))?;
        let archive = PathBuf::from(&record.file_path);
        if !path_exists(&archive).await {
            return Err(BackupError::ArchiveMissing(record.file_path).into());
        }

        if path_exists(target_dir).await {
            let mut entries = tokio::fs::read_dir(target_dir)
                .await
                .with_context(|| format!("read {}", target_dir.display()))?;
            if entries.next_entry().await?.is_some() {
                bail!("restore target {} is not empty", target_dir.display());
            }
        }

        extract_archive(&archive, target_dir).await?;
        let raw = tokio::fs::read(target_dir.join(METADATA_FILE_NAME))
            .await
            .context("read restored backup metadata")?;
        let metadata: BackupMetadata =
            serde_json::from_slice(&raw).context("parse restored backup metadata")?;
        info!(backup_id = id, target = %target_dir.display(), "backup restored");
        Ok(metadata)
    }

    /// Reads a backup's metadata document straight from its archive.
    pub async fn read_backup_metadata(&self, id: i64) -> Result<BackupMetadata> {
        let record = self
            .store
            .get_backup(id)
            .await?
            .ok_or(BackupError::NotFound(id))?;
        let raw = read_entry(Path::new(&record.file_path), METADATA_FILE_NAME)
            .await?
            .ok_or_else(|| anyhow::anyhow!("archive has no {METADATA_FILE_NAME}"))?;
        serde_json::from_slice(&raw).context("parse backup metadata")
    }

    /// Cross-checks the backup directory against stored records. With `remove`, orphan
    /// archives and scratch leftovers are deleted; records are never touched.
    ///
    /// Holds the run flag throughout: an in-flight backup owns files that have no record
    /// yet, so reconciling alongside one is refused with `AlreadyRunning`.
    pub async fn reconcile(&self, remove: bool) -> Result<OrphanReport> {
        let _guard = RunGuard::acquire(&self.running).ok_or(BackupError::AlreadyRunning)?;

        let records = self.store.all_backups().await?;
        let known: HashSet<String> = records.iter().map(|r| r.filename.clone()).collect();
        let mut report = OrphanReport::default();

        for record in &records {
            if !path_exists(Path::new(&record.file_path)).await {
                report.missing_files.push(record.id);
            }
        }

        let archive_suffix = format!(".{ARCHIVE_EXTENSION}");
        let mut entries = match tokio::fs::read_dir(&self.settings.backup_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
            Err(e) => return Err(e).context("read backup directory"),
        };

        let mut doomed = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let file_type = entry.file_type().await?;

            let is_scratch = (file_type.is_dir() && name.starts_with(SCRATCH_PREFIX))
                || (file_type.is_file() && name.ends_with(".partial"));
            if is_scratch {
                report.orphan_scratch.push(name);
                doomed.push(entry.path());
            } else if file_type.is_file() && name.ends_with(&archive_suffix) && !known.contains(&name)
            {
                report.orphan_archives.push(name);
                doomed.push(entry.path());
            }
        }
        report.orphan_archives.sort();
        report.orphan_scratch.sort();

        if remove {
            for path in doomed {
                let ok = if path.is_dir() {
                    remove_dir_best_effort(&path).await
                } else {
                    match remove_file_if_exists(&path).await {
                        Ok(_) => true,
                        Err(e) => {
                            warn!(path = %path.display(), error = %format!("{e:#}"), "orphan removal failed");
                            false
                        }
                    }
                };
                if ok {
                    report.removed += 1;
                }
            }
        }

        info!(
            orphan_archives = report.orphan_archives.len(),
            orphan_scratch = report.orphan_scratch.len(),
            missing_files = report.missing_files.len(),
            removed = report.removed,
            "backup directory reconciled"
        );
        Ok(report)
    }

    fn schedule_active(&self) -> bool {
        self.job_slot().is_some()
    }

    fn next_scheduled_run(&self) -> Option<DateTime<Utc>> {
        self.job_slot().as_ref().and_then(|job| job.next_fire_time())
    }

    fn job_slot(&self) -> MutexGuard<'_, Option<Box<dyn ScheduledJob>>> {
        self.scheduled_job
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn view(record: BackupRecord) -> BackupView {
    BackupView {
        file_exists: path_exists(Path::new(&record.file_path)).await,
        file_size_formatted: format_file_size(record.file_size),
        duration_formatted: format_duration(record.duration),
        record,
    }
}

/// Validates a schedule without registering it.
pub fn validate_schedule(expr: &str, timezone: &str) -> Result<DateTime<Utc>> {
    let schedule = CronSchedule::parse(expr, timezone)?;
    schedule
        .next_after(Utc::now())
        .ok_or_else(|| anyhow::anyhow!("schedule {expr:?} never fires"))
}
