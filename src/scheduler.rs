//! Cron triggers for backup profiles.
//!
//! The scheduler keeps one cron job per schedulable profile. A fire never runs
//! a backup inline: it hands `execute(profile_id, allow_disabled = false)` to
//! the [`RunSupervisor`] and returns, so a slow run cannot hold up the timer.
//! Expressions are evaluated in the host's local time zone.
//!
//! # Example
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use backup_orchestrator::backup::{BackupExecutor, ConfigStore};
//! # use backup_orchestrator::scheduler::BackupScheduler;
//! # use backup_orchestrator::supervisor::RunSupervisor;
//! # async fn demo(store: Arc<dyn ConfigStore>, executor: Arc<BackupExecutor>) -> anyhow::Result<()> {
//! let scheduler = BackupScheduler::new(store, executor, Arc::new(RunSupervisor::default())).await?;
//! let report = scheduler.load_all_schedules().await?;
//! println!("{} profiles scheduled", report.scheduled);
//! scheduler.stop().await?;
//! # Ok(())
//! # }
//! ```

use crate::backup::{BackupError, BackupExecutor, BackupProfile, ConfigStore, ExecutionOutcome, Result};
use crate::supervisor::RunSupervisor;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Outcome of a bulk reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleLoadReport {
    pub scheduled: usize,
    /// Profiles whose expression was rejected
    pub failed: Vec<i64>,
}

const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

fn invalid(expression: &str, reason: impl Into<String>) -> BackupError {
    BackupError::InvalidScheduleExpression {
        expression: expression.to_string(),
        reason: reason.into(),
    }
}

fn weekday_number(value: &str, expression: &str) -> Result<u32> {
    match value.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(invalid(expression, format!("day-of-week '{value}' is not in 0-7"))),
    }
}

/// Rewrite a numeric crontab day-of-week field (0-7, Sunday is 0 and 7) as day
/// names. The cron engine numbers days 1-7 from Sunday, so numbers cannot be
/// handed over as-is. Fields already using names, `*` and `?` pass through.
fn weekday_names(field: &str, expression: &str) -> Result<String> {
    if field == "*" || field == "?" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let mut days = std::collections::BTreeSet::new();
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => match step.parse::<usize>() {
                Ok(step) if step > 0 => (range, Some(step)),
                _ => return Err(invalid(expression, format!("bad day-of-week step in '{item}'"))),
            },
            None => (item, None),
        };

        let (first, last) = match range.split_once('-') {
            _ if range == "*" => (0, 6),
            Some((first, last)) => (weekday_number(first, expression)?, weekday_number(last, expression)?),
            None => {
                let day = weekday_number(range, expression)?;
                // `n/step` runs to the end of the week
                (day, if step.is_some() { day.max(6) } else { day })
            }
        };
        if first > last {
            return Err(invalid(expression, format!("day-of-week range '{range}' is reversed")));
        }

        days.extend((first..=last).step_by(step.unwrap_or(1)).map(|day| day % 7));
    }

    Ok(days
        .into_iter()
        .map(|day| WEEKDAYS[day as usize])
        .collect::<Vec<_>>()
        .join(","))
}

/// Turn a crontab expression into the seconds-first form the cron engine
/// expects. 5-field expressions gain a `0` seconds field; 6- and 7-field ones
/// keep their fields. In every case a numeric day-of-week is converted to
/// names using crontab numbering. `@` shorthands pass through.
pub fn normalize_cron(expression: &str) -> Result<String> {
    let expression = expression.trim();
    if expression.starts_with('@') {
        return Ok(expression.to_string());
    }

    let mut fields: Vec<String> = expression.split_whitespace().map(str::to_string).collect();
    match fields.len() {
        5 => fields.insert(0, "0".to_string()),
        6 | 7 => {}
        n => return Err(invalid(expression, format!("expected 5, 6 or 7 fields, found {n}"))),
    }
    fields[5] = weekday_names(&fields[5], expression)?;
    Ok(fields.join(" "))
}

pub struct BackupScheduler {
    scheduler: Arc<Mutex<JobScheduler>>,
    /// profile id -> cron job id
    jobs: Mutex<HashMap<i64, Uuid>>,
    config_store: Arc<dyn ConfigStore>,
    executor: Arc<BackupExecutor>,
    supervisor: Arc<RunSupervisor>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for BackupScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupScheduler")
            .field("stopped", &self.stopped)
            .finish_non_exhaustive()
    }
}

impl BackupScheduler {
    /// Create the cron engine and start its time-keeping loop. No profile is
    /// scheduled until `schedule_profile` or `load_all_schedules` is called.
    pub async fn new(
        config_store: Arc<dyn ConfigStore>,
        executor: Arc<BackupExecutor>,
        supervisor: Arc<RunSupervisor>,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| BackupError::Scheduler(format!("Failed to initialize job scheduler: {e}")))?;
        scheduler
            .start()
            .await
            .map_err(|e| BackupError::Scheduler(format!("Failed to start job scheduler: {e}")))?;

        info!("Backup scheduler started");
        Ok(Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            jobs: Mutex::new(HashMap::new()),
            config_store,
            executor,
            supervisor,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Install (or replace) the trigger for `profile`. Disabled profiles and
    /// profiles without an expression end up unscheduled without error.
    #[instrument(skip(self, profile), fields(profile_id = profile.id, profile = %profile.name))]
    pub async fn schedule_profile(&self, profile: &BackupProfile) -> Result<()> {
        if self.is_stopped() {
            return Err(BackupError::ShuttingDown);
        }

        let mut jobs = self.jobs.lock().await;
        if let Some(existing) = jobs.remove(&profile.id) {
            self.remove_job(profile.id, existing).await;
        }

        let Some(expression) = profile.schedule_expression() else {
            debug!("Profile has no schedule, leaving it unscheduled");
            return Ok(());
        };
        if !profile.enabled {
            debug!("Profile is disabled, leaving it unscheduled");
            return Ok(());
        }

        let normalized = normalize_cron(expression)?;
        let job = self.build_job(profile.id, &normalized).map_err(|e| {
            BackupError::InvalidScheduleExpression {
                expression: expression.to_string(),
                reason: e.to_string(),
            }
        })?;

        let job_id = self
            .scheduler
            .lock()
            .await
            .add(job)
            .await
            .map_err(|e| BackupError::Scheduler(format!("Failed to add job to scheduler: {e}")))?;
        jobs.insert(profile.id, job_id);

        info!(cron = %normalized, job_id = %job_id, "Scheduled backup profile");
        Ok(())
    }

    fn build_job(
        &self,
        profile_id: i64,
        expression: &str,
    ) -> std::result::Result<Job, tokio_cron_scheduler::JobSchedulerError> {
        let executor = Arc::clone(&self.executor);
        let supervisor = Arc::clone(&self.supervisor);

        Job::new_async_tz(expression, Local, move |_uuid, _scheduler| {
            let executor = Arc::clone(&executor);
            let supervisor = Arc::clone(&supervisor);

            Box::pin(async move {
                debug!(profile_id, "Backup schedule fired");
                let submitted = supervisor.submit(format!("scheduled-backup-{profile_id}"), async move {
                    match executor.execute(profile_id, false).await {
                        Ok(ExecutionOutcome::Completed(run)) => info!(
                            profile_id,
                            run_id = run.id,
                            status = %run.status,
                            "Scheduled backup finished"
                        ),
                        Ok(ExecutionOutcome::Skipped { reason, .. }) => {
                            info!(profile_id, %reason, "Scheduled backup skipped")
                        }
                        Err(e) => warn!(profile_id, error = %e, "Scheduled backup did not run"),
                    }
                });
                if let Err(e) = submitted {
                    warn!(profile_id, error = %e, "Dropping scheduled backup fire");
                }
            })
        })
    }

    async fn remove_job(&self, profile_id: i64, job_id: Uuid) {
        if let Err(e) = self.scheduler.lock().await.remove(&job_id).await {
            warn!(profile_id, job_id = %job_id, error = %e, "Failed to remove cron job");
        } else {
            debug!(profile_id, job_id = %job_id, "Removed cron job");
        }
    }

    /// Remove the trigger for `profile_id` if there is one.
    #[instrument(skip(self))]
    pub async fn unschedule_profile(&self, profile_id: i64) {
        let removed = self.jobs.lock().await.remove(&profile_id);
        if let Some(job_id) = removed {
            self.remove_job(profile_id, job_id).await;
            info!("Unscheduled backup profile");
        }
    }

    /// Schedule every enabled profile that has an expression. A rejected
    /// expression is logged and skipped; only a failed read is an error.
    #[instrument(skip(self))]
    pub async fn load_all_schedules(&self) -> Result<ScheduleLoadReport> {
        let profiles = self.config_store.list_scheduled_profiles().await?;
        let mut report = ScheduleLoadReport::default();

        for profile in &profiles {
            match self.schedule_profile(profile).await {
                Ok(()) if self.is_scheduled(profile.id).await => report.scheduled += 1,
                Ok(()) => {}
                Err(e) => {
                    warn!(profile_id = profile.id, error = %e, "Failed to schedule backup profile");
                    report.failed.push(profile.id);
                }
            }
        }

        info!(
            scheduled = report.scheduled,
            failed = report.failed.len(),
            "Loaded backup schedules"
        );
        Ok(report)
    }

    pub async fn is_scheduled(&self, profile_id: i64) -> bool {
        self.jobs.lock().await.contains_key(&profile_id)
    }

    /// Next time the trigger for `profile_id` fires, if it is scheduled.
    pub async fn next_fire(&self, profile_id: i64) -> Result<Option<DateTime<Utc>>> {
        let Some(job_id) = self.jobs.lock().await.get(&profile_id).copied() else {
            return Ok(None);
        };
        self.scheduler
            .lock()
            .await
            .next_tick_for_job(job_id)
            .await
            .map_err(|e| BackupError::Scheduler(format!("Failed to read next fire time: {e}")))
    }

    /// Ids of all profiles holding a trigger, ascending.
    pub async fn scheduled_profiles(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.jobs.lock().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Halt the time-keeping loop. Runs already handed to the supervisor keep
    /// going. Calling this more than once is a no-op.
    pub async fn stop(&self) -> Result<()> {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.jobs.lock().await.clear();
        self.scheduler
            .lock()
            .await
            .shutdown()
            .await
            .map_err(|e| BackupError::Scheduler(format!("Failed to shutdown job scheduler: {e}")))?;

        info!("Backup scheduler stopped");
        Ok(())
    }
}
