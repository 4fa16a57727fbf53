//! Persisted record of backup executions.
//!
//! The ledger owns the write path for runs: status transitions, the execution
//! transcript, per-file records and the running totals. Every mutation is
//! applied to the caller's in-memory `BackupRun` first and then persisted, so
//! the caller's copy always matches the stored row.

use super::{
    BackupError, BackupFile, BackupRun, BackupRunLog, LogLevel, NewBackupFile, NewBackupRun,
    Result, RunFilter, RunStore,
};
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, instrument};

#[derive(Debug, Clone)]
pub struct RunLedger {
    store: Arc<dyn RunStore>,
}

impl RunLedger {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        Self { store }
    }

    #[instrument(skip(self))]
    pub async fn create_run(
        &self,
        profile_id: i64,
        local_backup_path: Option<PathBuf>,
    ) -> Result<BackupRun> {
        let run = self
            .store
            .insert_run(&NewBackupRun {
                profile_id,
                local_backup_path,
            })
            .await?;
        debug!(run_id = run.id, "Created pending backup run");
        Ok(run)
    }

    /// pending -> running; also records the destination root when it is known.
    pub async fn mark_running(
        &self,
        run: &mut BackupRun,
        local_backup_path: Option<PathBuf>,
    ) -> Result<()> {
        run.mark_running(Utc::now())?;
        if local_backup_path.is_some() {
            run.local_backup_path = local_backup_path;
        }
        self.store.update_run(run).await
    }

    /// Append a line to the run transcript and write an auxiliary log entry.
    pub async fn append_log(
        &self,
        run: &mut BackupRun,
        level: LogLevel,
        message: &str,
    ) -> Result<BackupRunLog> {
        run.log.push_str(&format!(
            "[{}] {}: {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            level.as_str().to_uppercase(),
            message
        ));
        let entry = self.store.insert_log(run.id, level, message).await?;
        self.store.update_run(run).await?;
        Ok(entry)
    }

    /// Record one retrieved file and fold it into the run totals.
    pub async fn record_file(
        &self,
        run: &mut BackupRun,
        remote_path: &str,
        local_path: &Path,
        size_bytes: u64,
    ) -> Result<BackupFile> {
        let size_bytes = i64::try_from(size_bytes).unwrap_or(i64::MAX);
        let file = self
            .store
            .insert_file(&NewBackupFile {
                run_id: run.id,
                local_path: local_path.to_path_buf(),
                remote_path: remote_path.to_string(),
                size_bytes,
            })
            .await?;

        run.total_files += 1;
        run.total_size_bytes = run.total_size_bytes.saturating_add(size_bytes);
        self.store.update_run(run).await?;
        Ok(file)
    }

    /// running -> succeeded, or running -> failed with `error` as the message.
    pub async fn finish(&self, run: &mut BackupRun, error: Option<String>) -> Result<()> {
        let now = Utc::now();
        match error {
            None => run.mark_succeeded(now)?,
            Some(message) => run.mark_failed(now, message)?,
        }
        self.store.update_run(run).await
    }

    pub async fn get_run(&self, id: i64) -> Result<BackupRun> {
        self.store.get_run(id).await
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<BackupRun>> {
        self.store.list_runs(filter).await
    }

    pub async fn list_files(&self, run_id: i64) -> Result<Vec<BackupFile>> {
        self.store.get_run(run_id).await?;
        self.store.list_files(run_id).await
    }

    pub async fn list_logs(&self, run_id: i64) -> Result<Vec<BackupRunLog>> {
        self.store.get_run(run_id).await?;
        self.store.list_logs(run_id).await
    }

    /// Delete a run with its files and log entries. Artifacts on disk are left alone.
    #[instrument(skip(self))]
    pub async fn delete_run(&self, id: i64) -> Result<()> {
        self.store.delete_run(id).await
    }

    /// Look up a retrieved file and confirm it still exists on disk.
    pub async fn locate_backup_file(&self, file_id: i64) -> Result<BackupFile> {
        let file = self.store.get_file(file_id).await?;
        let present = tokio::fs::metadata(&file.local_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if !present {
            return Err(BackupError::ArtifactMissing {
                path: file.local_path.display().to_string(),
            });
        }
        Ok(file)
    }
}
