use crate::application::DependencyContainer;
use crate::backup::{ExecutionOutcome, RunFilter, RunStatus};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub struct BackupCommandHandler {
    container: Arc<DependencyContainer>,
}

impl BackupCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    /// Manual run, awaited. Disabled profiles run too.
    pub async fn run(&self, profile_id: i64) -> Result<()> {
        info!("💾 Running backup for profile {}...", profile_id);

        match self.container.engine.execute_backup(profile_id, true).await? {
            ExecutionOutcome::Completed(run) => {
                match run.status {
                    RunStatus::Succeeded => info!(
                        "✅ Backup run {} succeeded: {} files, {} bytes",
                        run.id, run.total_files, run.total_size_bytes
                    ),
                    _ => error!(
                        "❌ Backup run {} failed: {}",
                        run.id,
                        run.error_message.as_deref().unwrap_or("unknown error")
                    ),
                }
                print_json(&run)
            }
            ExecutionOutcome::Skipped { reason, .. } => {
                warn!("⚠️  Backup skipped: {}", reason);
                Ok(())
            }
        }
    }

    pub async fn dry_run(&self, profile_id: i64) -> Result<()> {
        let report = self.container.engine.dry_run(profile_id).await?;
        print_json(&report)
    }
}

pub struct RunCommandHandler {
    container: Arc<DependencyContainer>,
}

impl RunCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn list(&self, profile_id: Option<i64>, status: Option<String>) -> Result<()> {
        let status = status.map(|s| s.parse::<RunStatus>()).transpose()?;
        let runs = self
            .container
            .engine
            .list_runs(&RunFilter { profile_id, status })
            .await?;
        print_json(&runs)
    }

    pub async fn show(&self, run_id: i64) -> Result<()> {
        print_json(&self.container.engine.get_run(run_id).await?)
    }

    pub async fn files(&self, run_id: i64) -> Result<()> {
        print_json(&self.container.engine.list_run_files(run_id).await?)
    }

    pub async fn logs(&self, run_id: i64) -> Result<()> {
        print_json(&self.container.engine.list_run_logs(run_id).await?)
    }

    pub async fn delete(&self, run_id: i64) -> Result<()> {
        self.container.engine.delete_run(run_id).await?;
        info!("🗑️  Deleted backup run {}", run_id);
        Ok(())
    }

    pub async fn locate_file(&self, file_id: i64) -> Result<()> {
        let file = self.container.engine.open_backup_file(file_id).await?;
        println!("{}", file.local_path.display());
        Ok(())
    }
}

pub struct ServerCommandHandler {
    container: Arc<DependencyContainer>,
}

impl ServerCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn test(&self, server_id: i64) -> Result<()> {
        info!("🔌 Testing connection to server {}...", server_id);
        match self.container.engine.test_server_connection(server_id).await {
            Ok(()) => {
                info!("✅ Connection successful");
                Ok(())
            }
            Err(e) => {
                error!("❌ Connection failed: {}", e);
                Err(e.into())
            }
        }
    }

    pub async fn list_files(&self, server_id: i64, path: Option<String>) -> Result<()> {
        let entries = self
            .container
            .engine
            .list_server_files(server_id, path.as_deref())
            .await?;
        print_json(&entries)
    }
}

pub struct DatabaseCommandHandler {
    container: Arc<DependencyContainer>,
}

impl DatabaseCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn init(&self) -> Result<()> {
        info!("🗄️  Creating backup tables...");
        self.container.store.initialize().await?;
        info!("✅ Database schema is ready");
        Ok(())
    }
}
