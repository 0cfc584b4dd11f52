use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use factory_backup_core::BackupError;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type Job = Arc<dyn Fn() -> JobFuture + Send + Sync>;

/// Handle to one registered recurring trigger.
pub trait ScheduledJob: Send + Sync {
    fn expression(&self) -> &str;

    fn next_fire_time(&self) -> Option<DateTime<Utc>>;

    /// Stops future fires. A job already started keeps running.
    fn cancel(&self);
}

/// Recurring trigger capability, injected so the manager can be driven by hand in tests.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, expr: &str, timezone: &str, job: Job) -> Result<Box<dyn ScheduledJob>>;
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// A parsed cron expression bound to a time zone.
///
/// Accepts the classic five-field form (`minute hour day month weekday`, weekday 0-7 with
/// 0 and 7 meaning Sunday) as well as six or seven fields with a leading seconds column.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: cron::Schedule,
    tz: Tz,
}

impl CronSchedule {
    pub fn parse(expr: &str, timezone: &str) -> Result<Self, BackupError> {
        let tz: Tz = timezone
            .parse()
            .map_err(|_| BackupError::UnknownTimeZone(timezone.to_owned()))?;

        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = match fields.len() {
            5 => {
                let weekday = translate_weekdays(fields[4]);
                format!("0 {} {} {} {} {}", fields[0], fields[1], fields[2], fields[3], weekday)
            }
            6 | 7 => fields.join(" "),
            n => {
                return Err(BackupError::InvalidSchedule {
                    expr: expr.to_owned(),
                    reason: format!("expected 5 to 7 fields, found {n}"),
                })
            }
        };

        let schedule =
            cron::Schedule::from_str(&normalized).map_err(|e| BackupError::InvalidSchedule {
                expr: expr.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            expr: expr.to_owned(),
            schedule,
            tz,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expr
    }

    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&self.tz))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Numeric weekdays follow the classic crontab numbering; the cron parser counts from
/// Sunday = 1, so numbers are rewritten to names.
fn translate_weekdays(field: &str) -> String {
    field
        .split(',')
        .map(|part| {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => (range, Some(step)),
                None => (part, None),
            };
            let range = range
                .split('-')
                .map(|token| match token.parse::<usize>() {
                    Ok(n) if n <= 7 => WEEKDAYS[n % 7].to_owned(),
                    _ => token.to_owned(),
                })
                .collect::<Vec<_>>()
                .join("-");
            match step {
                Some(step) => format!("{range}/{step}"),
                None => range,
            }
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Wall-clock scheduler: one tokio task per registration, sleeping until the next
/// matching instant. Each fire runs on its own task so cancelling the trigger never
/// interrupts a run in progress.
#[derive(Debug, Default, Clone)]
pub struct CronScheduler;

impl Scheduler for CronScheduler {
    fn schedule(&self, expr: &str, timezone: &str, job: Job) -> Result<Box<dyn ScheduledJob>> {
        let schedule = CronSchedule::parse(expr, timezone)?;
        let driver = schedule.clone();

        let handle = tokio::spawn(async move {
            let mut after = Utc::now();
            loop {
                let Some(next) = driver.next_after(after) else {
                    warn!(schedule = %driver.expression(), "cron expression has no future fire times");
                    break;
                };
                let wait = (next - Utc::now()).to_std().unwrap_or_default();
                debug!(next_run = %next, "waiting for next scheduled fire");
                sleep(wait).await;
                tokio::spawn(job());
                after = resume_point(next, Utc::now());
            }
        });

        Ok(Box::new(CronJob { schedule, handle }))
    }
}

/// Where to look for the tick after `fired`. A wall clock still behind the tick must
/// not yield the same tick again; one that jumped ahead skips the missed ticks.
fn resume_point(fired: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    fired.max(now)
}

struct CronJob {
    schedule: CronSchedule,
    handle: JoinHandle<()>,
}

impl ScheduledJob for CronJob {
    fn expression(&self) -> &str {
        self.schedule.expression()
    }

    fn next_fire_time(&self) -> Option<DateTime<Utc>> {
        if self.handle.is_finished() {
            return None;
        }
        self.schedule.next_after(Utc::now())
    }

    fn cancel(&self) {
        self.handle.abort();
    }
}

impl Drop for CronJob {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
