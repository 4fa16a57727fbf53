use super::{BackupError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

pub const DEFAULT_SSH_PORT: u16 = 22;

/// A remote machine the engine backs up from.
///
/// `private_key` and `password` are write-only from the outside: they are never
/// serialized and are redacted from `Debug` output.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Server {
    pub id: i64,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub username: String,
    /// `key` or `password`; kept as text so unknown modes surface as errors at connect time
    pub auth_type: String,
    /// Inline PEM key material, or a path to a key file on the engine host
    #[serde(default, skip_serializing)]
    pub private_key: String,
    #[serde(default, skip_serializing)]
    pub password: String,
}

impl Server {
    /// Copy of the record with every secret field cleared.
    pub fn sanitized(&self) -> Self {
        Self {
            private_key: String::new(),
            password: String::new(),
            ..self.clone()
        }
    }

    pub fn effective_port(&self) -> u16 {
        if self.port == 0 {
            DEFAULT_SSH_PORT
        } else {
            self.port
        }
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |s: &str| if s.is_empty() { "" } else { "<redacted>" };
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth_type", &self.auth_type)
            .field("private_key", &redact(&self.private_key))
            .field("password", &redact(&self.password))
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    Key,
    Password,
}

impl FromStr for AuthMode {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "key" => Ok(Self::Key),
            "password" => Ok(Self::Password),
            other => Err(BackupError::UnsupportedAuthMode {
                mode: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageLocation {
    pub id: i64,
    pub name: String,
    pub base_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamingRule {
    pub id: i64,
    pub name: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupProfile {
    pub id: i64,
    pub name: String,
    pub server_id: i64,
    pub storage_location_id: i64,
    pub naming_rule_id: i64,
    pub enabled: bool,
    /// Cron expression; `None` or blank means manual-only
    pub schedule_cron: Option<String>,
}

impl BackupProfile {
    pub fn schedule_expression(&self) -> Option<&str> {
        self.schedule_cron
            .as_deref()
            .map(str::trim)
            .filter(|expr| !expr.is_empty())
    }

    /// Whether the scheduler should hold a trigger for this profile.
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.schedule_expression().is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStage {
    Pre,
    Post,
}

impl RunStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pre => "pre",
            Self::Post => "post",
        }
    }
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStage {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pre" => Ok(Self::Pre),
            "post" => Ok(Self::Post),
            other => Err(BackupError::Configuration {
                message: format!("unknown run stage '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Command {
    pub id: i64,
    pub profile_id: i64,
    pub command: String,
    pub run_stage: RunStage,
    pub run_order: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileRule {
    pub id: i64,
    pub profile_id: i64,
    pub remote_path: String,
    /// Descend into sub-directories when `remote_path` is a directory
    pub recursive: bool,
    /// Regular expression matched against the full remote path; matches are skipped
    pub exclude_pattern: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }

    /// pending -> running -> {succeeded, failed}; nothing else.
    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (Self::Running, Self::Succeeded)
                | (Self::Running, Self::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(BackupError::Configuration {
                message: format!("unknown run status '{other}'"),
            }),
        }
    }
}

/// One execution of a backup profile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRun {
    pub id: i64,
    pub profile_id: i64,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub local_backup_path: Option<PathBuf>,
    pub total_files: i64,
    pub total_size_bytes: i64,
    pub error_message: Option<String>,
    pub log: String,
}

impl BackupRun {
    fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(BackupError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }

    pub fn mark_running(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(RunStatus::Running)?;
        self.start_time = Some(at);
        Ok(())
    }

    pub fn mark_succeeded(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.transition(RunStatus::Succeeded)?;
        self.end_time = Some(at);
        Ok(())
    }

    pub fn mark_failed(&mut self, at: DateTime<Utc>, message: impl Into<String>) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.end_time = Some(at);
        self.error_message = Some(message.into());
        Ok(())
    }
}

/// Insert payload for a run; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBackupRun {
    pub profile_id: i64,
    pub local_backup_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupFile {
    pub id: i64,
    pub run_id: i64,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewBackupFile {
    pub run_id: i64,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            other => Err(BackupError::Configuration {
                message: format!("unknown log level '{other}'"),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackupRunLog {
    pub id: i64,
    pub run_id: i64,
    pub created_at: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

/// Filter for listing runs; `None` fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunFilter {
    pub profile_id: Option<i64>,
    pub status: Option<RunStatus>,
}
