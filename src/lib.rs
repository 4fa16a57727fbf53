pub mod application;
pub mod backup;
pub mod config;
pub mod engine;
pub mod naming;
pub mod remote;
pub mod retry;
pub mod scheduler;
pub mod supervisor;

pub use config::Config;

// Re-export backup types
pub use backup::{
    BackupError, BackupExecutor, BackupFile, BackupProfile, BackupRun, BackupRunLog,
    CommandFailurePolicy, ConfigStore, DryRunReport, ExecutionOutcome, MemoryStore,
    PostgresStore, RunLedger, RunStatus, RunStore, Server,
};

pub use engine::{Accepted, BackupEngine};
pub use remote::{RemoteConnector, RemoteSession, SshConnector};
pub use scheduler::{BackupScheduler, ScheduleLoadReport};
pub use supervisor::RunSupervisor;
