pub mod config;
pub mod manager;
pub mod notify;
pub mod scheduler;
pub mod server;

pub use manager::{
    validate_schedule, BackupManager, BackupPage, BackupResult, BackupSettings, BackupStatistics,
    BackupView, ManagerStatus, OrphanReport, VerifyReport,
};
pub use notify::{LogNotifier, Notifier, WebhookNotifier};
pub use scheduler::{CronSchedule, CronScheduler, Job, JobFuture, ScheduledJob, Scheduler};
pub use server::{build_router, AppState};
