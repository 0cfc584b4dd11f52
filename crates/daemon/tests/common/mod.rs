#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use factory_backup_core::{BackupRecord, BackupTotals, NewBackupRecord};
use factory_backup_daemon::{
    BackupManager, BackupSettings, CronSchedule, Job, Notifier, ScheduledJob, Scheduler,
};
use factory_backup_export::{DatabaseExporter, DatabaseSnapshot, SqliteFileExporter};
use factory_backup_storage::{MetadataStore, SqliteStore};
use rusqlite::Connection;
use serde_json::Value;
use tokio::sync::Notify;

/// Scheduler that never fires on its own; tests call `fire`.
#[derive(Default)]
pub struct ManualScheduler {
    jobs: Mutex<Vec<(Arc<AtomicBool>, Job)>>,
}

struct ManualJob {
    schedule: CronSchedule,
    cancelled: Arc<AtomicBool>,
}

impl ScheduledJob for ManualJob {
    fn expression(&self) -> &str {
        self.schedule.expression()
    }

    fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        if self.cancelled.load(Ordering::SeqCst) {
            return None;
        }
        self.schedule.next_after(Utc::now())
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, expr: &str, timezone: &str, job: Job) -> Result<Box<dyn ScheduledJob>> {
        let schedule = CronSchedule::parse(expr, timezone)?;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.jobs.lock().unwrap().push((cancelled.clone(), job));
        Ok(Box::new(ManualJob {
            schedule,
            cancelled,
        }))
    }
}

impl ManualScheduler {
    pub fn registered(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    pub fn active(&self) -> usize {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(cancelled, _)| !cancelled.load(Ordering::SeqCst))
            .count()
    }

    /// Runs every active job once, to completion.
    pub async fn fire(&self) {
        let jobs: Vec<Job> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|(cancelled, _)| !cancelled.load(Ordering::SeqCst))
            .map(|(_, job)| job.clone())
            .collect();
        for job in jobs {
            job().await;
        }
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<(String, String, Value)>>,
}

#[async_trait::async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_role(&self, role: &str, event: &str, payload: Value) {
        self.events
            .lock()
            .unwrap()
            .push((role.to_owned(), event.to_owned(), payload));
    }
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<(String, String, Value)> {
        self.events.lock().unwrap().clone()
    }
}

/// SQLite store with switchable faults. `park_insert` holds `insert_backup` until
/// `insert_release` is notified.
pub struct FaultyStore {
    pub inner: SqliteStore,
    pub fail_list_tables: AtomicBool,
    pub fail_insert: AtomicBool,
    pub fail_backups_beyond: AtomicBool,
    /// Id whose row delete fails; 0 disables.
    pub fail_delete_id: AtomicI64,
    pub park_insert: AtomicBool,
    pub insert_entered: Notify,
    pub insert_release: Notify,
}

#[async_trait::async_trait]
impl MetadataStore for FaultyStore {
    async fn insert_backup(&self, record: &NewBackupRecord) -> Result<BackupRecord> {
        if self.park_insert.load(Ordering::SeqCst) {
            self.insert_entered.notify_one();
            self.insert_release.notified().await;
        }
        if self.fail_insert.load(Ordering::SeqCst) {
            bail!("insert refused");
        }
        self.inner.insert_backup(record).await
    }

    async fn list_backups(&self, offset: i64, limit: i64) -> Result<Vec<BackupRecord>> {
        self.inner.list_backups(offset, limit).await
    }

    async fn count_backups(&self) -> Result<i64> {
        self.inner.count_backups().await
    }

    async fn all_backups(&self) -> Result<Vec<BackupRecord>> {
        self.inner.all_backups().await
    }

    async fn get_backup(&self, id: i64) -> Result<Option<BackupRecord>> {
        self.inner.get_backup(id).await
    }

    async fn delete_backup(&self, id: i64) -> Result<bool> {
        if self.fail_delete_id.load(Ordering::SeqCst) == id {
            bail!("row {id} is locked");
        }
        self.inner.delete_backup(id).await
    }

    async fn backups_beyond(&self, keep: i64) -> Result<Vec<BackupRecord>> {
        if self.fail_backups_beyond.load(Ordering::SeqCst) {
            bail!("retention query failed");
        }
        self.inner.backups_beyond(keep).await
    }

    async fn statistics(&self) -> Result<BackupTotals> {
        self.inner.statistics().await
    }

    async fn list_tables(&self) -> Result<Vec<String>> {
        if self.fail_list_tables.load(Ordering::SeqCst) {
            bail!("catalog unavailable");
        }
        self.inner.list_tables().await
    }

    async fn count_rows(&self, table: &str) -> Result<i64> {
        self.inner.count_rows(table).await
    }
}

/// File exporter that can be told to fail or to park until released.
pub struct TestExporter {
    pub inner: SqliteFileExporter,
    pub fail: AtomicBool,
    pub gated: AtomicBool,
    pub entered: Notify,
    pub release: Notify,
}

#[async_trait::async_trait]
impl DatabaseExporter for TestExporter {
    fn engine(&self) -> &'static str {
        "sqlite"
    }

    async fn export(&self, dest_dir: &Path) -> Result<DatabaseSnapshot> {
        if self.gated.load(Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            bail!("disk full");
        }
        self.inner.export(dest_dir).await
    }
}

pub struct Harness {
    pub tmp: tempfile::TempDir,
    pub db_path: PathBuf,
    pub backup_dir: PathBuf,
    pub uploads_dir: PathBuf,
    pub store: Arc<FaultyStore>,
    pub exporter: Arc<TestExporter>,
    pub scheduler: Arc<ManualScheduler>,
    pub notifier: Arc<RecordingNotifier>,
    pub manager: Arc<BackupManager>,
}

pub fn seed_database(path: &Path) {
    let conn = Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS products (id INTEGER PRIMARY KEY, name TEXT NOT NULL);
         CREATE TABLE IF NOT EXISTS production_batches (id INTEGER PRIMARY KEY, product_id INTEGER NOT NULL);
         INSERT INTO products(id, name) VALUES (1, 'bolt'), (2, 'nut'), (3, 'washer');
         INSERT INTO production_batches(id, product_id) VALUES (1, 1), (2, 3);",
    )
    .unwrap();
}

pub fn seed_uploads(dir: &Path) {
    std::fs::create_dir_all(dir.join("quality/reports")).unwrap();
    std::fs::write(dir.join("logo.png"), b"\x89PNG fake").unwrap();
    std::fs::write(dir.join("quality/reports/qc-001.pdf"), vec![1u8; 2048]).unwrap();
}

impl Harness {
    pub fn new(max_backups: i64) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let db_path = tmp.path().join("data/factory.db");
        let backup_dir = tmp.path().join("backups");
        let uploads_dir = tmp.path().join("uploads");

        let inner = SqliteStore::new(db_path.clone()).unwrap();
        seed_database(&db_path);
        seed_uploads(&uploads_dir);

        let store = Arc::new(FaultyStore {
            inner,
            fail_list_tables: AtomicBool::new(false),
            fail_insert: AtomicBool::new(false),
            fail_backups_beyond: AtomicBool::new(false),
            fail_delete_id: AtomicI64::new(0),
            park_insert: AtomicBool::new(false),
            insert_entered: Notify::new(),
            insert_release: Notify::new(),
        });
        let exporter = Arc::new(TestExporter {
            inner: SqliteFileExporter::new(db_path.clone()),
            fail: AtomicBool::new(false),
            gated: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let scheduler = Arc::new(ManualScheduler::default());
        let notifier = Arc::new(RecordingNotifier::default());

        let manager = BackupManager::new(
            BackupSettings {
                backup_dir: backup_dir.clone(),
                uploads_dir: uploads_dir.clone(),
                max_backups,
                schedule: "0 2 * * *".to_owned(),
                timezone: "UTC".to_owned(),
                schedule_enabled: true,
            },
            store.clone(),
            exporter.clone(),
            scheduler.clone(),
            notifier.clone(),
        );

        Self {
            tmp,
            db_path,
            backup_dir,
            uploads_dir,
            store,
            exporter,
            scheduler,
            notifier,
            manager,
        }
    }

    /// Names in the backup directory, sorted.
    pub fn backup_dir_entries(&self) -> Vec<String> {
        let mut names: Vec<String> = match std::fs::read_dir(&self.backup_dir) {
            Ok(rd) => rd
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect(),
            Err(_) => Vec::new(),
        };
        names.sort();
        names
    }

    pub fn archives(&self) -> Vec<String> {
        self.backup_dir_entries()
            .into_iter()
            .filter(|n| n.ends_with(".tar.zst"))
            .collect()
    }

    pub fn scratch_dirs(&self) -> Vec<String> {
        self.backup_dir_entries()
            .into_iter()
            .filter(|n| n.starts_with("temp_"))
            .collect()
    }
}

/// Keeps consecutive backup names distinct.
pub async fn tick() {
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
}
