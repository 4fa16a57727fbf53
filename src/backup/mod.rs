pub mod executor;
pub mod ledger;
pub mod memory_store;
pub mod models;
pub mod repository;

pub use executor::*;
pub use ledger::*;
pub use memory_store::*;
pub use models::*;
pub use repository::*;

/// Boxed transport error carried as the `source` of connector failures.
pub type TransportError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Invalid schedule expression '{expression}': {reason}")]
    InvalidScheduleExpression { expression: String, reason: String },

    #[error("Invalid credential: {message}")]
    InvalidCredential { message: String },

    #[error("Missing credential: {message}")]
    MissingCredential { message: String },

    #[error("Unsupported auth_type: {mode}")]
    UnsupportedAuthMode { mode: String },

    #[error("SSH connection to {address} failed: {source}")]
    DialFailed {
        address: String,
        #[source]
        source: TransportError,
    },

    #[error("SSH session failed: {message}: {source}")]
    SessionFailed {
        message: String,
        #[source]
        source: TransportError,
    },

    #[error("SSH command '{command}' failed (exit status {exit_status:?}): {stderr}")]
    CommandFailed {
        command: String,
        exit_status: Option<i32>,
        stderr: String,
    },

    #[error("Transfer of {remote_path} failed: {source}")]
    TransferFailed {
        remote_path: String,
        #[source]
        source: TransportError,
    },

    #[error("Storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid run status transition from {from} to {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("A backup run for profile {profile_id} is already in progress")]
    RunInProgress { profile_id: i64 },

    #[error("Backup file not found on disk: {path}")]
    ArtifactMissing { path: String },

    #[error("Backup engine is shutting down")]
    ShuttingDown,

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

impl BackupError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
