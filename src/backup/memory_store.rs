use super::{
    BackupError, BackupFile, BackupProfile, BackupRun, BackupRunLog, Command, ConfigStore,
    FileRule, LogLevel, NamingRule, NewBackupFile, NewBackupRun, Result, RunFilter, RunStatus,
    RunStore, Server, StorageLocation,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    servers: BTreeMap<i64, Server>,
    storage_locations: BTreeMap<i64, StorageLocation>,
    naming_rules: BTreeMap<i64, NamingRule>,
    profiles: BTreeMap<i64, BackupProfile>,
    commands: BTreeMap<i64, Command>,
    file_rules: BTreeMap<i64, FileRule>,
    runs: BTreeMap<i64, BackupRun>,
    files: BTreeMap<i64, BackupFile>,
    logs: BTreeMap<i64, BackupRunLog>,
    next_id: i64,
}

impl Tables {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Process-local store implementing both `ConfigStore` and `RunStore`.
///
/// Used by the test-suite and by embedders that keep configuration elsewhere.
/// Configuration writers (`put_*`) take records with their ids already set.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put_server(&self, server: Server) {
        self.tables.write().await.servers.insert(server.id, server);
    }

    pub async fn put_storage_location(&self, location: StorageLocation) {
        self.tables
            .write()
            .await
            .storage_locations
            .insert(location.id, location);
    }

    pub async fn put_naming_rule(&self, rule: NamingRule) {
        self.tables.write().await.naming_rules.insert(rule.id, rule);
    }

    pub async fn put_profile(&self, profile: BackupProfile) {
        self.tables.write().await.profiles.insert(profile.id, profile);
    }

    pub async fn remove_profile(&self, id: i64) {
        self.tables.write().await.profiles.remove(&id);
    }

    pub async fn put_command(&self, command: Command) {
        self.tables.write().await.commands.insert(command.id, command);
    }

    pub async fn put_file_rule(&self, rule: FileRule) {
        self.tables.write().await.file_rules.insert(rule.id, rule);
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get_server(&self, id: i64) -> Result<Server> {
        self.tables
            .read()
            .await
            .servers
            .get(&id)
            .cloned()
            .ok_or_else(|| BackupError::not_found("server", id))
    }

    async fn list_servers(&self) -> Result<Vec<Server>> {
        Ok(self.tables.read().await.servers.values().cloned().collect())
    }

    async fn get_profile(&self, id: i64) -> Result<BackupProfile> {
        self.tables
            .read()
            .await
            .profiles
            .get(&id)
            .cloned()
            .ok_or_else(|| BackupError::not_found("backup profile", id))
    }

    async fn list_profiles(&self) -> Result<Vec<BackupProfile>> {
        Ok(self.tables.read().await.profiles.values().cloned().collect())
    }

    async fn list_scheduled_profiles(&self) -> Result<Vec<BackupProfile>> {
        Ok(self
            .tables
            .read()
            .await
            .profiles
            .values()
            .filter(|p| p.is_schedulable())
            .cloned()
            .collect())
    }

    async fn list_commands(&self, profile_id: i64) -> Result<Vec<Command>> {
        let mut commands: Vec<Command> = self
            .tables
            .read()
            .await
            .commands
            .values()
            .filter(|c| c.profile_id == profile_id)
            .cloned()
            .collect();
        commands.sort_by_key(|c| (c.run_order, c.id));
        Ok(commands)
    }

    async fn list_file_rules(&self, profile_id: i64) -> Result<Vec<FileRule>> {
        Ok(self
            .tables
            .read()
            .await
            .file_rules
            .values()
            .filter(|r| r.profile_id == profile_id)
            .cloned()
            .collect())
    }

    async fn get_naming_rule(&self, id: i64) -> Result<NamingRule> {
        self.tables
            .read()
            .await
            .naming_rules
            .get(&id)
            .cloned()
            .ok_or_else(|| BackupError::not_found("naming rule", id))
    }

    async fn get_storage_location(&self, id: i64) -> Result<StorageLocation> {
        self.tables
            .read()
            .await
            .storage_locations
            .get(&id)
            .cloned()
            .ok_or_else(|| BackupError::not_found("storage location", id))
    }
}

#[async_trait]
impl RunStore for MemoryStore {
    async fn insert_run(&self, run: &NewBackupRun) -> Result<BackupRun> {
        let mut tables = self.tables.write().await;
        let record = BackupRun {
            id: tables.next_id(),
            profile_id: run.profile_id,
            start_time: None,
            end_time: None,
            status: RunStatus::Pending,
            local_backup_path: run.local_backup_path.clone(),
            total_files: 0,
            total_size_bytes: 0,
            error_message: None,
            log: String::new(),
        };
        tables.runs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_run(&self, run: &BackupRun) -> Result<()> {
        let mut tables = self.tables.write().await;
        match tables.runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(BackupError::not_found("backup run", run.id)),
        }
    }

    async fn get_run(&self, id: i64) -> Result<BackupRun> {
        self.tables
            .read()
            .await
            .runs
            .get(&id)
            .cloned()
            .ok_or_else(|| BackupError::not_found("backup run", id))
    }

    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<BackupRun>> {
        Ok(self
            .tables
            .read()
            .await
            .runs
            .values()
            .rev()
            .filter(|r| filter.profile_id.map_or(true, |id| r.profile_id == id))
            .filter(|r| filter.status.map_or(true, |s| r.status == s))
            .cloned()
            .collect())
    }

    async fn insert_file(&self, file: &NewBackupFile) -> Result<BackupFile> {
        let mut tables = self.tables.write().await;
        if !tables.runs.contains_key(&file.run_id) {
            return Err(BackupError::not_found("backup run", file.run_id));
        }
        let record = BackupFile {
            id: tables.next_id(),
            run_id: file.run_id,
            local_path: file.local_path.clone(),
            remote_path: file.remote_path.clone(),
            size_bytes: file.size_bytes,
        };
        tables.files.insert(record.id, record.clone());
        Ok(record)
    }

    async fn get_file(&self, id: i64) -> Result<BackupFile> {
        self.tables
            .read()
            .await
            .files
            .get(&id)
            .cloned()
            .ok_or_else(|| BackupError::not_found("backup file", id))
    }

    async fn list_files(&self, run_id: i64) -> Result<Vec<BackupFile>> {
        Ok(self
            .tables
            .read()
            .await
            .files
            .values()
            .filter(|f| f.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn insert_log(
        &self,
        run_id: i64,
        level: LogLevel,
        message: &str,
    ) -> Result<BackupRunLog> {
        let mut tables = self.tables.write().await;
        if !tables.runs.contains_key(&run_id) {
            return Err(BackupError::not_found("backup run", run_id));
        }
        let record = BackupRunLog {
            id: tables.next_id(),
            run_id,
            created_at: Utc::now(),
            level,
            message: message.to_string(),
        };
        tables.logs.insert(record.id, record.clone());
        Ok(record)
    }

    async fn list_logs(&self, run_id: i64) -> Result<Vec<BackupRunLog>> {
        Ok(self
            .tables
            .read()
            .await
            .logs
            .values()
            .filter(|l| l.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn delete_run(&self, id: i64) -> Result<()> {
        let mut tables = self.tables.write().await;
        if !tables.runs.contains_key(&id) {
            return Err(BackupError::not_found("backup run", id));
        }
        tables.logs.retain(|_, log| log.run_id != id);
        tables.files.retain(|_, file| file.run_id != id);
        tables.runs.remove(&id);
        Ok(())
    }
}
