//! Remote execution and file transfer against backup targets.
//!
//! [`RemoteConnector`] turns a [`Server`] record into an authenticated
//! [`RemoteSession`]. The production implementation is [`SshConnector`]; tests
//! substitute their own connector behind the same traits.

pub mod keys;
pub mod ssh;

pub use ssh::SshConnector;

use crate::backup::{AuthMode, BackupError, Result, Server, DEFAULT_SSH_PORT};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the connector treats the remote host's identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Accept any host key. Matches the historical behavior and is insecure:
    /// a man-in-the-middle can impersonate the target. Logged on every connect.
    Insecure,
    /// Require the host key to be present and matching in an OpenSSH known_hosts file.
    KnownHosts(PathBuf),
}

impl Default for HostKeyPolicy {
    fn default() -> Self {
        Self::Insecure
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshConfig {
    /// Bound on TCP connect and SSH handshake; commands and transfers are unbounded
    pub connect_timeout: Duration,
    pub host_key_policy: HostKeyPolicy,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

/// Output of a remote command that exited with status 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteEntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    pub kind: RemoteEntryKind,
    pub size: u64,
}

impl RemoteEntry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            kind: RemoteEntryKind::File,
            size,
        }
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: RemoteEntryKind::Directory,
            size: 0,
        }
    }

    pub fn is_file(&self) -> bool {
        self.kind == RemoteEntryKind::File
    }
}

/// An authenticated session owned by exactly one run.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run `command`; a non-zero exit status is `CommandFailed`.
    async fn exec(&self, command: &str) -> Result<CommandOutput>;

    /// Regular files at or under `path`. A file path yields itself; a directory
    /// yields its files, descending only when `recursive` is set.
    async fn list_files(&self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>>;

    /// Immediate children of a directory, files and directories alike.
    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>>;

    /// Copy `remote` to `local`, creating parent directories; returns bytes written.
    async fn download(&self, remote: &str, local: &Path) -> Result<u64>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait RemoteConnector: Send + Sync + std::fmt::Debug {
    async fn connect(&self, server: &Server) -> Result<Box<dyn RemoteSession>>;

    /// Connect and run a trivial command.
    async fn test_connection(&self, server: &Server) -> Result<()> {
        let session = self.connect(server).await?;
        let result = session.exec("echo test").await.map(|_| ());
        let closed = session.close().await;
        result.and(closed)
    }
}

/// Secret material resolved from a server record.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    PrivateKey(String),
    Password(String),
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PrivateKey(_) => f.write_str("PrivateKey(<redacted>)"),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
        }
    }
}

/// Resolve the secret for `server` according to its auth type.
///
/// For `key`, a value naming an existing regular file is read from disk;
/// anything else is treated as inline key material.
pub fn resolve_credential(server: &Server) -> Result<Credential> {
    match server.auth_type.parse::<AuthMode>()? {
        AuthMode::Key => {
            let stored = server.private_key.trim();
            if stored.is_empty() {
                return Err(BackupError::MissingCredential {
                    message: format!("server {} has no private key configured", server.name),
                });
            }

            let path = Path::new(stored);
            let material = if path.is_file() {
                std::fs::read_to_string(path).map_err(|e| BackupError::InvalidCredential {
                    message: format!("failed to read private key file {stored}: {e}"),
                })?
            } else {
                stored.to_string()
            };

            keys::validate_private_key(&material).map_err(|reason| {
                BackupError::InvalidCredential {
                    message: format!("private key for server {} cannot be parsed: {reason}", server.name),
                }
            })?;
            Ok(Credential::PrivateKey(material))
        }
        AuthMode::Password => {
            if server.password.is_empty() {
                return Err(BackupError::MissingCredential {
                    message: format!("server {} has no password configured", server.name),
                });
            }
            Ok(Credential::Password(server.password.clone()))
        }
    }
}

/// Host and port to dial. A port embedded in `host` (`name:port` or
/// `[v6]:port`) wins over `port`; zero falls back to 22. IPv6 brackets are
/// stripped from the returned host.
pub fn split_address(host: &str, port: u16) -> (String, u16) {
    let host = host.trim();
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return (addr.ip().to_string(), addr.port());
    }

    if let Some((name, embedded)) = host.rsplit_once(':') {
        if !name.contains(':') && !name.is_empty() {
            if let Ok(embedded) = embedded.parse::<u16>() {
                return (name.to_string(), embedded);
            }
        }
    }

    let port = if port == 0 { DEFAULT_SSH_PORT } else { port };
    let bare = host.trim_start_matches('[').trim_end_matches(']');
    (bare.to_string(), port)
}

/// `host:port` to dial, bracketing IPv6 hosts.
pub fn normalize_address(host: &str, port: u16) -> String {
    let (host, port) = split_address(host, port);
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
