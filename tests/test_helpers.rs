//! Shared fixtures for the integration tests.
//!
//! `FakeRemote` stands in for an SSH target: it holds an in-memory file tree,
//! records every command it is asked to run, and can be told to fail
//! connections, commands or individual downloads.

#![allow(dead_code)]

use async_trait::async_trait;
use backup_orchestrator::backup::{
    BackupError, BackupExecutor, BackupProfile, Command, ExecutorConfig, FileRule, MemoryStore,
    NamingRule, Result, RunLedger, RunStage, RunStatus, Server, StorageLocation,
};
use backup_orchestrator::config::BackupConfig;
use backup_orchestrator::engine::BackupEngine;
use backup_orchestrator::remote::{
    CommandOutput, RemoteConnector, RemoteEntry, RemoteSession,
};
use backup_orchestrator::retry::RetryConfig;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

pub const PROFILE_ID: i64 = 1;
pub const SERVER_ID: i64 = 1;

#[derive(Debug, Default)]
struct FakeState {
    fail_connect: bool,
    failing_commands: HashSet<String>,
    failing_listings: HashSet<String>,
    files: BTreeMap<String, Vec<u8>>,
    /// remote path -> remaining failures (u32::MAX fails forever)
    failing_downloads: HashMap<String, u32>,
    executed: Vec<String>,
    downloads: Vec<String>,
    connects: usize,
    closes: usize,
    command_delay: Option<Duration>,
}

#[derive(Debug, Default)]
pub struct FakeRemote {
    state: Mutex<FakeState>,
}

impl FakeRemote {
    fn with_state<T>(&self, f: impl FnOnce(&mut FakeState) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn add_file(&self, path: &str, contents: &[u8]) {
        self.with_state(|s| s.files.insert(path.to_string(), contents.to_vec()));
    }

    pub fn fail_connect(&self) {
        self.with_state(|s| s.fail_connect = true);
    }

    pub fn fail_command(&self, command: &str) {
        self.with_state(|s| s.failing_commands.insert(command.to_string()));
    }

    pub fn fail_listing(&self, path: &str) {
        self.with_state(|s| s.failing_listings.insert(path.to_string()));
    }

    pub fn fail_download(&self, path: &str, times: u32) {
        self.with_state(|s| s.failing_downloads.insert(path.to_string(), times));
    }

    pub fn delay_commands(&self, delay: Duration) {
        self.with_state(|s| s.command_delay = Some(delay));
    }

    pub fn executed(&self) -> Vec<String> {
        self.with_state(|s| s.executed.clone())
    }

    pub fn downloads(&self) -> Vec<String> {
        self.with_state(|s| s.downloads.clone())
    }

    pub fn connects(&self) -> usize {
        self.with_state(|s| s.connects)
    }

    pub fn closes(&self) -> usize {
        self.with_state(|s| s.closes)
    }
}

#[derive(Debug, Clone)]
pub struct FakeConnector {
    pub remote: Arc<FakeRemote>,
}

#[async_trait]
impl RemoteConnector for FakeConnector {
    async fn connect(&self, server: &Server) -> Result<Box<dyn RemoteSession>> {
        let refused = self.remote.with_state(|s| {
            s.connects += 1;
            s.fail_connect
        });
        if refused {
            return Err(BackupError::DialFailed {
                address: format!("{}:{}", server.host, server.effective_port()),
                source: "connection refused".into(),
            });
        }
        Ok(Box::new(FakeSession {
            remote: Arc::clone(&self.remote),
        }))
    }
}

struct FakeSession {
    remote: Arc<FakeRemote>,
}

#[async_trait]
impl RemoteSession for FakeSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let (delay, fails) = self.remote.with_state(|s| {
            s.executed.push(command.to_string());
            (s.command_delay, s.failing_commands.contains(command))
        });
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fails {
            return Err(BackupError::CommandFailed {
                command: command.to_string(),
                exit_status: Some(1),
                stderr: "simulated failure".to_string(),
            });
        }
        Ok(CommandOutput {
            stdout: format!("ran {command}"),
            stderr: String::new(),
            exit_status: 0,
        })
    }

    async fn list_files(&self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
        self.remote.with_state(|s| {
            if s.failing_listings.contains(path) {
                return Err(BackupError::SessionFailed {
                    message: format!("cannot list {path}"),
                    source: "permission denied".into(),
                });
            }
            if let Some(contents) = s.files.get(path) {
                return Ok(vec![RemoteEntry::file(path, contents.len() as u64)]);
            }

            let prefix = format!("{}/", path.trim_end_matches('/'));
            let entries: Vec<RemoteEntry> = s
                .files
                .iter()
                .filter(|(p, _)| p.starts_with(&prefix))
                .filter(|(p, _)| recursive || !p[prefix.len()..].contains('/'))
                .map(|(p, c)| RemoteEntry::file(p.clone(), c.len() as u64))
                .collect();
            if entries.is_empty() {
                return Err(BackupError::SessionFailed {
                    message: format!("cannot stat {path}"),
                    source: "no such file".into(),
                });
            }
            Ok(entries)
        })
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        Ok(self.remote.with_state(|s| {
            let mut dirs = BTreeSet::new();
            let mut entries = Vec::new();
            for (p, c) in s.files.iter().filter(|(p, _)| p.starts_with(&prefix)) {
                match p[prefix.len()..].split_once('/') {
                    Some((dir, _)) => {
                        dirs.insert(format!("{prefix}{dir}"));
                    }
                    None => entries.push(RemoteEntry::file(p.clone(), c.len() as u64)),
                }
            }
            entries.extend(dirs.into_iter().map(RemoteEntry::directory));
            entries
        }))
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64> {
        let contents = self.remote.with_state(|s| {
            s.downloads.push(remote.to_string());
            if let Some(remaining) = s.failing_downloads.get_mut(remote) {
                if *remaining > 0 {
                    if *remaining != u32::MAX {
                        *remaining -= 1;
                    }
                    return Err(BackupError::TransferFailed {
                        remote_path: remote.to_string(),
                        source: "connection reset".into(),
                    });
                }
            }
            s.files
                .get(remote)
                .cloned()
                .ok_or_else(|| BackupError::TransferFailed {
                    remote_path: remote.to_string(),
                    source: "no such file".into(),
                })
        })?;

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(local, &contents).await?;
        Ok(contents.len() as u64)
    }

    async fn close(&self) -> Result<()> {
        self.remote.with_state(|s| s.closes += 1);
        Ok(())
    }
}

/// In-memory configuration plus a fake remote and a temporary backup root.
pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub remote: Arc<FakeRemote>,
    pub connector: Arc<FakeConnector>,
    pub backup_root: TempDir,
}

impl TestEnv {
    /// Server 1, storage location 1, naming rule 1 (`{SERVER_NAME}/{profile}`)
    /// and enabled profile 1 scheduled nightly.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let remote = Arc::new(FakeRemote::default());
        let connector = Arc::new(FakeConnector {
            remote: Arc::clone(&remote),
        });
        let backup_root = tempfile::tempdir().expect("tempdir");

        store
            .put_server(Server {
                id: SERVER_ID,
                name: "db1".to_string(),
                host: "10.0.0.1".to_string(),
                port: 22,
                username: "backup".to_string(),
                auth_type: "password".to_string(),
                private_key: String::new(),
                password: "hunter2".to_string(),
            })
            .await;
        store
            .put_storage_location(StorageLocation {
                id: 1,
                name: "local".to_string(),
                base_path: backup_root.path().to_path_buf(),
            })
            .await;
        store
            .put_naming_rule(NamingRule {
                id: 1,
                name: "per-profile".to_string(),
                pattern: "{SERVER_NAME}/{profile}".to_string(),
            })
            .await;
        store.put_profile(profile(PROFILE_ID, "nightly", true, Some("0 2 * * *"))).await;

        Self {
            store,
            remote,
            connector,
            backup_root,
        }
    }

    /// Where runs of profile 1 land.
    pub fn destination(&self) -> PathBuf {
        self.backup_root.path().join("db1").join("nightly")
    }

    pub async fn add_command(&self, id: i64, stage: RunStage, order: i32, command: &str) {
        self.store
            .put_command(Command {
                id,
                profile_id: PROFILE_ID,
                command: command.to_string(),
                run_stage: stage,
                run_order: order,
            })
            .await;
    }

    pub async fn add_file_rule(
        &self,
        id: i64,
        remote_path: &str,
        recursive: bool,
        exclude: Option<&str>,
    ) {
        self.store
            .put_file_rule(FileRule {
                id,
                profile_id: PROFILE_ID,
                remote_path: remote_path.to_string(),
                recursive,
                exclude_pattern: exclude.map(str::to_string),
            })
            .await;
    }

    pub fn ledger(&self) -> RunLedger {
        RunLedger::new(self.store.clone())
    }

    pub fn executor(&self, config: ExecutorConfig) -> BackupExecutor {
        BackupExecutor::new(
            self.store.clone(),
            self.ledger(),
            self.connector.clone(),
            config,
        )
    }

    pub async fn engine(&self, config: &BackupConfig) -> BackupEngine {
        BackupEngine::new(
            self.store.clone(),
            self.store.clone(),
            self.connector.clone(),
            config,
        )
        .await
        .expect("engine")
    }
}

pub fn profile(id: i64, name: &str, enabled: bool, cron: Option<&str>) -> BackupProfile {
    BackupProfile {
        id,
        name: name.to_string(),
        server_id: SERVER_ID,
        storage_location_id: 1,
        naming_rule_id: 1,
        enabled,
        schedule_cron: cron.map(str::to_string),
    }
}

/// Executor settings without retry back-off delays.
pub fn fast_config() -> ExecutorConfig {
    ExecutorConfig {
        transfer_retry: RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(1),
            jitter: false,
            ..RetryConfig::default()
        },
        ..ExecutorConfig::default()
    }
}

/// Poll the ledger until `run_id` is terminal or `timeout` passes.
pub async fn wait_for_terminal(
    ledger: &RunLedger,
    run_id: i64,
    timeout: Duration,
) -> backup_orchestrator::BackupRun {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let run = ledger.get_run(run_id).await.expect("run exists");
        if run.status.is_terminal() || tokio::time::Instant::now() >= deadline {
            return run;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until some run of `profile_id` reaches a terminal status.
pub async fn wait_for_profile_run(
    ledger: &RunLedger,
    profile_id: i64,
    timeout: Duration,
) -> Option<backup_orchestrator::BackupRun> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let runs = ledger
            .list_runs(&backup_orchestrator::backup::RunFilter {
                profile_id: Some(profile_id),
                status: None,
            })
            .await
            .expect("list runs");
        if let Some(run) = runs.into_iter().find(|r| r.status.is_terminal()) {
            return Some(run);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

pub fn assert_terminal(status: RunStatus) {
    assert!(status.is_terminal(), "run ended in {status}");
}
