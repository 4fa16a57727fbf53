//! The operations the administrative layer calls.

use crate::backup::{
    BackupExecutor, BackupFile, BackupRun, BackupRunLog, ConfigStore, DryRunReport,
    ExecutionOutcome, Result, RunFilter, RunLedger, RunStore,
};
use crate::config::BackupConfig;
use crate::naming;
use crate::remote::{RemoteConnector, RemoteEntry};
use crate::scheduler::{BackupScheduler, ScheduleLoadReport};
use crate::supervisor::RunSupervisor;
use chrono::Local;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const DEFAULT_BROWSE_PATH: &str = "/home";
pub const BACKUP_STARTED: &str = "Backup started";

/// Acknowledgement for a backup handed off to the supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub profile_id: i64,
    /// Set when the run record was created before the hand-off
    pub run_id: Option<i64>,
    pub message: String,
}

#[derive(Debug)]
pub struct BackupEngine {
    config_store: Arc<dyn ConfigStore>,
    ledger: RunLedger,
    connector: Arc<dyn RemoteConnector>,
    executor: Arc<BackupExecutor>,
    scheduler: BackupScheduler,
    supervisor: Arc<RunSupervisor>,
}

impl BackupEngine {
    pub async fn new(
        config_store: Arc<dyn ConfigStore>,
        run_store: Arc<dyn RunStore>,
        connector: Arc<dyn RemoteConnector>,
        config: &BackupConfig,
    ) -> Result<Self> {
        let ledger = RunLedger::new(run_store);
        let executor = Arc::new(BackupExecutor::new(
            Arc::clone(&config_store),
            ledger.clone(),
            Arc::clone(&connector),
            config.executor_config(),
        ));
        let supervisor = Arc::new(RunSupervisor::new(
            config.max_concurrent_runs,
            config.shutdown_grace(),
        ));
        let scheduler = BackupScheduler::new(
            Arc::clone(&config_store),
            Arc::clone(&executor),
            Arc::clone(&supervisor),
        )
        .await?;

        Ok(Self {
            config_store,
            ledger,
            connector,
            executor,
            scheduler,
            supervisor,
        })
    }

    pub fn executor(&self) -> &Arc<BackupExecutor> {
        &self.executor
    }

    pub fn scheduler(&self) -> &BackupScheduler {
        &self.scheduler
    }

    pub fn supervisor(&self) -> &Arc<RunSupervisor> {
        &self.supervisor
    }

    /// Create a pending run without executing it.
    pub async fn create_run(&self, profile_id: i64) -> Result<BackupRun> {
        self.config_store.get_profile(profile_id).await?;
        self.ledger.create_run(profile_id, None).await
    }

    /// Run a backup and wait for it to finish.
    pub async fn execute_backup(
        &self,
        profile_id: i64,
        allow_disabled: bool,
    ) -> Result<ExecutionOutcome> {
        self.executor.execute(profile_id, allow_disabled).await
    }

    /// Manual trigger: runs in the background, disabled profiles included.
    #[instrument(skip(self))]
    pub async fn trigger_backup(&self, profile_id: i64) -> Result<Accepted> {
        self.config_store.get_profile(profile_id).await?;

        let executor = Arc::clone(&self.executor);
        self.supervisor
            .submit(format!("manual-backup-{profile_id}"), async move {
                match executor.execute(profile_id, true).await {
                    Ok(outcome) => {
                        if let Some(run) = outcome.run() {
                            info!(profile_id, run_id = run.id, status = %run.status, "Manual backup finished");
                        }
                    }
                    Err(e) => warn!(profile_id, error = %e, "Manual backup did not run"),
                }
            })?;

        Ok(Accepted {
            profile_id,
            run_id: None,
            message: BACKUP_STARTED.to_string(),
        })
    }

    /// Create the run record now and execute it in the background.
    #[instrument(skip(self))]
    pub async fn start_backup(&self, profile_id: i64) -> Result<Accepted> {
        let run = self.create_run(profile_id).await?;
        let run_id = run.id;

        let executor = Arc::clone(&self.executor);
        self.supervisor
            .submit(format!("backup-run-{run_id}"), async move {
                match executor.execute_run(run_id).await {
                    Ok(run) => info!(run_id, status = %run.status, "Backup run finished"),
                    Err(e) => warn!(run_id, error = %e, "Backup run did not execute"),
                }
            })?;

        Ok(Accepted {
            profile_id,
            run_id: Some(run_id),
            message: BACKUP_STARTED.to_string(),
        })
    }

    /// Re-read the profile and install, replace or drop its trigger.
    pub async fn schedule_profile(&self, profile_id: i64) -> Result<()> {
        let profile = self.config_store.get_profile(profile_id).await?;
        self.scheduler.schedule_profile(&profile).await
    }

    pub async fn unschedule_profile(&self, profile_id: i64) {
        self.scheduler.unschedule_profile(profile_id).await
    }

    pub async fn load_all_schedules(&self) -> Result<ScheduleLoadReport> {
        self.scheduler.load_all_schedules().await
    }

    /// Preview a naming pattern with placeholder values and the current time.
    pub fn translate(&self, pattern: &str) -> String {
        naming::preview(pattern, &Local::now())
    }

    pub async fn dry_run(&self, profile_id: i64) -> Result<DryRunReport> {
        self.executor.dry_run(profile_id).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<BackupRun>> {
        self.ledger.list_runs(filter).await
    }

    pub async fn get_run(&self, run_id: i64) -> Result<BackupRun> {
        self.ledger.get_run(run_id).await
    }

    pub async fn list_run_files(&self, run_id: i64) -> Result<Vec<BackupFile>> {
        self.ledger.list_files(run_id).await
    }

    pub async fn list_run_logs(&self, run_id: i64) -> Result<Vec<BackupRunLog>> {
        self.ledger.list_logs(run_id).await
    }

    pub async fn delete_run(&self, run_id: i64) -> Result<()> {
        self.ledger.delete_run(run_id).await
    }

    /// The file record of a retrieved artifact; its `local_path` is present on disk.
    pub async fn open_backup_file(&self, file_id: i64) -> Result<BackupFile> {
        self.ledger.locate_backup_file(file_id).await
    }

    #[instrument(skip(self))]
    pub async fn test_server_connection(&self, server_id: i64) -> Result<()> {
        let server = self.config_store.get_server(server_id).await?;
        self.connector.test_connection(&server).await?;
        info!(server = %server.name, "Connection test succeeded");
        Ok(())
    }

    /// One level of the server's filesystem at `path` (default `/home`).
    #[instrument(skip(self))]
    pub async fn list_server_files(
        &self,
        server_id: i64,
        path: Option<&str>,
    ) -> Result<Vec<RemoteEntry>> {
        let server = self.config_store.get_server(server_id).await?;
        let path = path
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_BROWSE_PATH);

        let session = self.connector.connect(&server).await?;
        let listing = session.list_directory(path).await;
        if let Err(e) = session.close().await {
            warn!(server = %server.name, error = %e, "Failed to close session");
        }
        listing
    }

    /// Stop firing schedules, then wait for in-flight runs.
    pub async fn shutdown(&self) -> Result<()> {
        self.scheduler.stop().await?;
        let aborted = self.supervisor.shutdown().await;
        if aborted > 0 {
            warn!(aborted, "Backup runs were aborted during shutdown");
        }
        Ok(())
    }
}
