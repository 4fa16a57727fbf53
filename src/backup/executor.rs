//! End-to-end execution of one backup run.
//!
//! A run always ends in a terminal state once its record exists: connection
//! failures, fatal command failures and per-file transfer failures are captured
//! into the record and its transcript rather than returned to the caller.

use super::{
    BackupError, BackupProfile, BackupRun, Command, ConfigStore, FileRule, LogLevel, NamingRule,
    Result, RunLedger, RunStage, RunStatus, Server, StorageLocation,
};
use crate::naming::{self, NamingContext};
use crate::remote::{RemoteConnector, RemoteEntry, RemoteSession};
use crate::retry::{RetryConfig, RetryPolicy};
use chrono::{DateTime, Local, TimeZone};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt::Display;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info, instrument, warn};

pub const DRY_RUN_MESSAGE: &str = "Dry run only, nothing executed";

/// What a failing pre/post command does to the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandFailurePolicy {
    /// The first failure is fatal; everything after it is skipped.
    #[default]
    Abort,
    /// Log the failure and keep going.
    Continue,
}

impl FromStr for CommandFailurePolicy {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" => Ok(Self::Abort),
            "continue" => Ok(Self::Continue),
            other => Err(BackupError::Configuration {
                message: format!("unknown command failure policy '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub command_failure_policy: CommandFailurePolicy,
    pub transfer_retry: RetryConfig,
    /// Permit concurrent runs of the same profile
    pub allow_overlapping_runs: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            command_failure_policy: CommandFailurePolicy::default(),
            transfer_retry: RetryConfig::default(),
            allow_overlapping_runs: false,
        }
    }
}

/// Per-profile run exclusivity. At most one [`ProfileLease`] exists per profile id.
#[derive(Debug, Default)]
pub struct ProfileLocks {
    held: Mutex<HashSet<i64>>,
}

impl ProfileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(self: &Arc<Self>, profile_id: i64) -> Option<ProfileLease> {
        let inserted = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(profile_id);
        inserted.then(|| ProfileLease {
            locks: Arc::clone(self),
            profile_id,
        })
    }

    pub fn is_held(&self, profile_id: i64) -> bool {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&profile_id)
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct ProfileLease {
    locks: Arc<ProfileLocks>,
    profile_id: i64,
}

impl Drop for ProfileLease {
    fn drop(&mut self) {
        self.locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.profile_id);
    }
}

/// Everything a run needs, read once at the start of the run.
#[derive(Debug, Clone, Serialize)]
pub struct ProfileSnapshot {
    pub profile: BackupProfile,
    pub server: Server,
    pub storage_location: StorageLocation,
    pub naming_rule: NamingRule,
    /// Sorted by (run_order, id)
    pub commands: Vec<Command>,
    pub file_rules: Vec<FileRule>,
}

impl ProfileSnapshot {
    pub fn commands_for(&self, stage: RunStage) -> impl Iterator<Item = &Command> {
        self.commands.iter().filter(move |c| c.run_stage == stage)
    }

    /// `base_path / translate(pattern)` for the given instant.
    pub fn destination_root<Tz>(&self, now: &DateTime<Tz>) -> PathBuf
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let ctx = NamingContext {
            server_name: &self.server.name,
            server_host: &self.server.host,
            profile_name: &self.profile.name,
        };
        let name = naming::translate(&self.naming_rule.pattern, &ctx, now);
        let mut root = self.storage_location.base_path.clone();
        push_relative(&mut root, Path::new(&name));
        root
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum ExecutionOutcome {
    /// Disabled profile invoked without `allow_disabled`; no record was created.
    Skipped { profile_id: i64, reason: String },
    Completed(BackupRun),
}

impl ExecutionOutcome {
    pub fn run(&self) -> Option<&BackupRun> {
        match self {
            Self::Completed(run) => Some(run),
            Self::Skipped { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DryRunReport {
    pub profile: BackupProfile,
    pub server: Server,
    pub storage_location: StorageLocation,
    pub naming_rule: NamingRule,
    pub pre_commands: Vec<Command>,
    pub post_commands: Vec<Command>,
    pub file_rules: Vec<FileRule>,
    pub naming_preview: String,
    pub destination_preview: PathBuf,
    pub message: String,
}

/// Append only the normal components of `relative` to `out`.
fn push_relative(out: &mut PathBuf, relative: &Path) {
    for component in relative.components() {
        if let Component::Normal(part) = component {
            out.push(part);
        }
    }
}

/// Local path for `remote_path` retrieved through the rule rooted at `rule_path`.
///
/// The file keeps its position relative to the rule root, under a directory
/// named after the rule root's last component. Root, prefix and `..`
/// components never reach the output, so the result stays inside `root`.
pub fn local_destination(root: &Path, rule_path: &str, remote_path: &str) -> PathBuf {
    let trimmed = rule_path.trim_end_matches('/');
    let rule = Path::new(if trimmed.is_empty() { "/" } else { trimmed });
    let remote = Path::new(remote_path);

    let mut out = root.to_path_buf();
    match remote.strip_prefix(rule) {
        Ok(relative) => {
            if let Some(base) = rule.file_name() {
                out.push(base);
            }
            push_relative(&mut out, relative);
        }
        Err(_) => push_relative(&mut out, remote),
    }
    out
}

fn is_transient(err: &BackupError) -> bool {
    matches!(
        err,
        BackupError::TransferFailed { .. } | BackupError::SessionFailed { .. }
    )
}

#[derive(Debug, Clone)]
pub struct BackupExecutor {
    config_store: Arc<dyn ConfigStore>,
    ledger: RunLedger,
    connector: Arc<dyn RemoteConnector>,
    locks: Arc<ProfileLocks>,
    config: ExecutorConfig,
}

impl BackupExecutor {
    pub fn new(
        config_store: Arc<dyn ConfigStore>,
        ledger: RunLedger,
        connector: Arc<dyn RemoteConnector>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            config_store,
            ledger,
            connector,
            locks: Arc::new(ProfileLocks::new()),
            config,
        }
    }

    pub fn ledger(&self) -> &RunLedger {
        &self.ledger
    }

    pub fn locks(&self) -> &Arc<ProfileLocks> {
        &self.locks
    }

    pub async fn load_snapshot(&self, profile_id: i64) -> Result<ProfileSnapshot> {
        let profile = self.config_store.get_profile(profile_id).await?;
        let (server, storage_location, naming_rule, mut commands, file_rules) = futures::try_join!(
            self.config_store.get_server(profile.server_id),
            self.config_store
                .get_storage_location(profile.storage_location_id),
            self.config_store.get_naming_rule(profile.naming_rule_id),
            self.config_store.list_commands(profile_id),
            self.config_store.list_file_rules(profile_id),
        )?;
        commands.sort_by_key(|c| (c.run_order, c.id));

        Ok(ProfileSnapshot {
            profile,
            server,
            storage_location,
            naming_rule,
            commands,
            file_rules,
        })
    }

    fn acquire(&self, profile_id: i64) -> Result<Option<ProfileLease>> {
        if self.config.allow_overlapping_runs {
            return Ok(None);
        }
        self.locks
            .try_acquire(profile_id)
            .map(Some)
            .ok_or(BackupError::RunInProgress { profile_id })
    }

    /// Run a profile end to end. Errors are returned only when no run record
    /// was created (missing configuration, overlapping run) or when the run
    /// record itself cannot be persisted.
    #[instrument(skip(self))]
    pub async fn execute(&self, profile_id: i64, allow_disabled: bool) -> Result<ExecutionOutcome> {
        let snapshot = self.load_snapshot(profile_id).await?;

        if !snapshot.profile.enabled && !allow_disabled {
            info!(profile = %snapshot.profile.name, "Profile is disabled, skipping backup");
            return Ok(ExecutionOutcome::Skipped {
                profile_id,
                reason: format!("profile '{}' is disabled", snapshot.profile.name),
            });
        }

        let _lease = self.acquire(profile_id)?;

        let destination = snapshot.destination_root(&Local::now());
        let mut run = self
            .ledger
            .create_run(profile_id, Some(destination.clone()))
            .await?;
        self.ledger.mark_running(&mut run, None).await?;

        self.drive(&snapshot, &mut run, &destination).await?;
        Ok(ExecutionOutcome::Completed(run))
    }

    /// Execute a run that was created ahead of time and is still pending.
    #[instrument(skip(self))]
    pub async fn execute_run(&self, run_id: i64) -> Result<BackupRun> {
        let mut run = self.ledger.get_run(run_id).await?;
        if run.status != RunStatus::Pending {
            return Err(BackupError::InvalidTransition {
                from: run.status,
                to: RunStatus::Running,
            });
        }

        let prepared = match self.load_snapshot(run.profile_id).await {
            Ok(snapshot) => self.acquire(run.profile_id).map(|lease| (snapshot, lease)),
            Err(e) => Err(e),
        };
        let (snapshot, _lease) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                let message = format!("Backup could not start: {e}");
                self.ledger.mark_running(&mut run, None).await?;
                self.log(&mut run, LogLevel::Error, &message).await;
                self.ledger.finish(&mut run, Some(message)).await?;
                return Ok(run);
            }
        };

        let destination = run
            .local_backup_path
            .clone()
            .unwrap_or_else(|| snapshot.destination_root(&Local::now()));
        self.ledger
            .mark_running(&mut run, Some(destination.clone()))
            .await?;

        self.drive(&snapshot, &mut run, &destination).await?;
        Ok(run)
    }

    /// Describe what a run of the profile would do without doing it.
    pub async fn dry_run(&self, profile_id: i64) -> Result<DryRunReport> {
        let snapshot = self.load_snapshot(profile_id).await?;
        let now = Local::now();

        Ok(DryRunReport {
            pre_commands: snapshot.commands_for(RunStage::Pre).cloned().collect(),
            post_commands: snapshot.commands_for(RunStage::Post).cloned().collect(),
            naming_preview: naming::preview(&snapshot.naming_rule.pattern, &now),
            destination_preview: snapshot.destination_root(&now),
            server: snapshot.server.sanitized(),
            profile: snapshot.profile,
            storage_location: snapshot.storage_location,
            naming_rule: snapshot.naming_rule,
            file_rules: snapshot.file_rules,
            message: DRY_RUN_MESSAGE.to_string(),
        })
    }

    /// Write a transcript entry; a failed write is reported but never fails the run.
    async fn log(&self, run: &mut BackupRun, level: LogLevel, message: &str) {
        match level {
            LogLevel::Info => info!(run_id = run.id, "{}", message),
            LogLevel::Warn => warn!(run_id = run.id, "{}", message),
            LogLevel::Error => error!(run_id = run.id, "{}", message),
        }
        if let Err(e) = self.ledger.append_log(run, level, message).await {
            warn!(run_id = run.id, error = %e, "Failed to persist run log entry");
        }
    }

    async fn drive(
        &self,
        snapshot: &ProfileSnapshot,
        run: &mut BackupRun,
        destination: &Path,
    ) -> Result<()> {
        self.log(
            run,
            LogLevel::Info,
            &format!(
                "Starting backup of profile '{}' from server '{}' into {}",
                snapshot.profile.name,
                snapshot.server.name,
                destination.display()
            ),
        )
        .await;

        let session = match self.connector.connect(&snapshot.server).await {
            Ok(session) => session,
            Err(e) => {
                let message = format!("Failed to connect to server '{}': {e}", snapshot.server.name);
                self.log(run, LogLevel::Error, &message).await;
                return self.ledger.finish(run, Some(message)).await;
            }
        };

        let mut fatal = self
            .run_commands(run, session.as_ref(), snapshot, RunStage::Pre)
            .await;
        if fatal.is_none() {
            self.retrieve_files(run, session.as_ref(), snapshot, destination)
                .await;
            fatal = self
                .run_commands(run, session.as_ref(), snapshot, RunStage::Post)
                .await;
        } else {
            self.log(
                run,
                LogLevel::Warn,
                "Skipping file retrieval and post commands after a failed pre command",
            )
            .await;
        }

        if let Err(e) = session.close().await {
            self.log(run, LogLevel::Warn, &format!("Failed to close session: {e}"))
                .await;
        }

        match &fatal {
            None => {
                self.log(
                    run,
                    LogLevel::Info,
                    &format!(
                        "Backup finished: {} files, {} bytes",
                        run.total_files, run.total_size_bytes
                    ),
                )
                .await
            }
            Some(message) => {
                self.log(run, LogLevel::Error, &format!("Backup failed: {message}"))
                    .await
            }
        }
        self.ledger.finish(run, fatal).await
    }

    /// Returns the fatal error message, if the policy made one.
    async fn run_commands(
        &self,
        run: &mut BackupRun,
        session: &dyn RemoteSession,
        snapshot: &ProfileSnapshot,
        stage: RunStage,
    ) -> Option<String> {
        for command in snapshot.commands_for(stage) {
            self.log(
                run,
                LogLevel::Info,
                &format!("Running {stage} command: {}", command.command),
            )
            .await;

            match session.exec(&command.command).await {
                Ok(output) => {
                    let stdout = output.stdout.trim();
                    if !stdout.is_empty() {
                        self.log(run, LogLevel::Info, &format!("Output: {stdout}"))
                            .await;
                    }
                    let stderr = output.stderr.trim();
                    if !stderr.is_empty() {
                        self.log(run, LogLevel::Warn, &format!("Stderr: {stderr}"))
                            .await;
                    }
                }
                Err(e) => {
                    let message = format!("{stage} command failed: {e}");
                    self.log(run, LogLevel::Error, &message).await;
                    if self.config.command_failure_policy == CommandFailurePolicy::Abort {
                        return Some(message);
                    }
                }
            }
        }
        None
    }

    async fn retrieve_files(
        &self,
        run: &mut BackupRun,
        session: &dyn RemoteSession,
        snapshot: &ProfileSnapshot,
        destination: &Path,
    ) {
        let retry = RetryPolicy::new(self.config.transfer_retry.clone());

        for rule in &snapshot.file_rules {
            let exclude = rule
                .exclude_pattern
                .as_deref()
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(Regex::new)
                .transpose();
            let exclude = match exclude {
                Ok(exclude) => exclude,
                Err(e) => {
                    self.log(
                        run,
                        LogLevel::Error,
                        &format!(
                            "Invalid exclude pattern on rule for {}, skipping rule: {e}",
                            rule.remote_path
                        ),
                    )
                    .await;
                    continue;
                }
            };

            let entries = match session.list_files(&rule.remote_path, rule.recursive).await {
                Ok(entries) => entries,
                Err(e) => {
                    self.log(
                        run,
                        LogLevel::Error,
                        &format!("Failed to list {}: {e}", rule.remote_path),
                    )
                    .await;
                    continue;
                }
            };

            for entry in entries.iter().filter(|e| e.is_file()) {
                if exclude.as_ref().is_some_and(|re| re.is_match(&entry.path)) {
                    debug!(path = %entry.path, "Excluded by rule pattern");
                    continue;
                }
                self.retrieve_one(run, session, &retry, rule, entry, destination)
                    .await;
            }
        }
    }

    async fn retrieve_one(
        &self,
        run: &mut BackupRun,
        session: &dyn RemoteSession,
        retry: &RetryPolicy,
        rule: &FileRule,
        entry: &RemoteEntry,
        destination: &Path,
    ) {
        let local = local_destination(destination, &rule.remote_path, &entry.path);
        let (remote_path, local_path) = (entry.path.as_str(), local.as_path());

        let transferred = retry
            .execute_if(move || session.download(remote_path, local_path), is_transient)
            .await;

        match transferred {
            Ok(bytes) => {
                if let Err(e) = self.ledger.record_file(run, remote_path, local_path, bytes).await {
                    self.log(
                        run,
                        LogLevel::Error,
                        &format!("Retrieved {remote_path} but failed to record it: {e}"),
                    )
                    .await;
                    return;
                }
                self.log(
                    run,
                    LogLevel::Info,
                    &format!(
                        "Retrieved {remote_path} -> {} ({bytes} bytes)",
                        local_path.display()
                    ),
                )
                .await;
            }
            Err(e) => {
                self.log(
                    run,
                    LogLevel::Error,
                    &format!(
                        "Failed to retrieve {remote_path} after {} attempt(s): {e}",
                        retry.max_attempts()
                    ),
                )
                .await;
            }
        }
    }
}
