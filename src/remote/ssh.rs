use super::{
    normalize_address, resolve_credential, split_address, CommandOutput, Credential,
    HostKeyPolicy, RemoteConnector, RemoteEntry, RemoteSession, SshConfig,
};
use crate::backup::{BackupError, Result, Server};
use async_trait::async_trait;
use ssh2::{Channel, CheckResult, KnownHostFileKind, Session, Sftp};
use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// `ssh2`-backed connector. libssh2 is blocking, so every call runs on the
/// blocking thread pool.
#[derive(Debug, Clone, Default)]
pub struct SshConnector {
    config: SshConfig,
}

impl SshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SshConfig {
        &self.config
    }
}

fn session_error(message: impl Into<String>, source: ssh2::Error) -> BackupError {
    BackupError::SessionFailed {
        message: message.into(),
        source: Box::new(source),
    }
}

fn join_error(err: tokio::task::JoinError) -> BackupError {
    BackupError::SessionFailed {
        message: "SSH worker task failed".to_string(),
        source: Box::new(err),
    }
}

fn dial(address: &str, config: &SshConfig) -> Result<TcpStream> {
    let dial_failed = |source: std::io::Error| BackupError::DialFailed {
        address: address.to_string(),
        source: Box::new(source),
    };

    let mut last_error = None;
    for addr in address.to_socket_addrs().map_err(dial_failed)? {
        match TcpStream::connect_timeout(&addr, config.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%addr, error = %e, "TCP connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(dial_failed(last_error.unwrap_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "address resolved to no socket addresses",
        )
    })))
}

fn verify_host_key(session: &Session, server: &Server, policy: &HostKeyPolicy) -> Result<()> {
    let known_hosts_path = match policy {
        HostKeyPolicy::Insecure => {
            warn!(
                server = %server.name,
                host = %server.host,
                "Host key verification is disabled (SSH_HOST_KEY_POLICY=insecure); the remote identity is not checked"
            );
            return Ok(());
        }
        HostKeyPolicy::KnownHosts(path) => path,
    };

    let (key, _key_type) = session.host_key().ok_or_else(|| BackupError::SessionFailed {
        message: "remote host presented no host key".to_string(),
        source: "missing host key".into(),
    })?;

    let mut known_hosts = session
        .known_hosts()
        .map_err(|e| session_error("failed to initialize known hosts", e))?;
    known_hosts
        .read_file(known_hosts_path, KnownHostFileKind::OpenSSH)
        .map_err(|e| {
            session_error(
                format!("failed to read known hosts file {}", known_hosts_path.display()),
                e,
            )
        })?;

    let (host, port) = split_address(&server.host, server.port);
    let reason = match known_hosts.check_port(&host, port, key) {
        CheckResult::Match => return Ok(()),
        CheckResult::Mismatch => "host key does not match known_hosts entry",
        CheckResult::NotFound => "host is not listed in known_hosts",
        CheckResult::Failure => "known_hosts lookup failed",
    };
    Err(BackupError::SessionFailed {
        message: format!("host key verification failed for {}", server.host),
        source: reason.into(),
    })
}

fn open_session(server: &Server, credential: Credential, config: &SshConfig) -> Result<Session> {
    let address = normalize_address(&server.host, server.port);
    let stream = dial(&address, config)?;

    let mut session = Session::new().map_err(|e| session_error("failed to create session", e))?;
    session.set_tcp_stream(stream);
    session.set_timeout(u32::try_from(config.connect_timeout.as_millis()).unwrap_or(u32::MAX));
    session
        .handshake()
        .map_err(|e| session_error(format!("handshake with {address} failed"), e))?;

    verify_host_key(&session, server, &config.host_key_policy)?;

    match credential {
        Credential::PrivateKey(key) => session
            .userauth_pubkey_memory(&server.username, None, &key, None)
            .map_err(|e| session_error("public key authentication failed", e))?,
        Credential::Password(password) => session
            .userauth_password(&server.username, &password)
            .map_err(|e| session_error("password authentication failed", e))?,
    }
    if !session.authenticated() {
        return Err(BackupError::SessionFailed {
            message: format!("authentication as {} was rejected", server.username),
            source: "not authenticated".into(),
        });
    }

    // The bound applies to establishment only.
    session.set_timeout(0);
    Ok(session)
}

#[async_trait]
impl RemoteConnector for SshConnector {
    #[instrument(skip(self, server), fields(server = %server.name, host = %server.host))]
    async fn connect(&self, server: &Server) -> Result<Box<dyn RemoteSession>> {
        let credential = resolve_credential(server)?;
        let server = server.clone();
        let config = self.config.clone();

        let session =
            tokio::task::spawn_blocking(move || open_session(&server, credential, &config))
                .await
                .map_err(join_error)??;

        info!("SSH session established");
        Ok(Box::new(SshSession { session }))
    }
}

/// One authenticated libssh2 session.
pub struct SshSession {
    session: Session,
}

impl SshSession {
    async fn blocking<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(Session) -> Result<T> + Send + 'static,
    {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || op(session))
            .await
            .map_err(join_error)?
    }
}

fn sftp(session: &Session) -> Result<Sftp> {
    session
        .sftp()
        .map_err(|e| session_error("failed to open SFTP subsystem", e))
}

fn is_dot_entry(path: &Path) -> bool {
    matches!(
        path.file_name().and_then(|n| n.to_str()),
        Some(".") | Some("..")
    )
}

fn collect_files(sftp: &Sftp, root: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
    let root_path = Path::new(root);
    let stat = sftp
        .stat(root_path)
        .map_err(|e| session_error(format!("cannot stat {root}"), e))?;

    if !stat.is_dir() {
        return Ok(vec![RemoteEntry::file(root, stat.size.unwrap_or(0))]);
    }

    let mut files = Vec::new();
    let mut pending: Vec<PathBuf> = vec![root_path.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = sftp
            .readdir(&dir)
            .map_err(|e| session_error(format!("cannot list {}", dir.display()), e))?;
        for (path, stat) in entries {
            if is_dot_entry(&path) {
                continue;
            }
            if stat.is_dir() {
                if recursive {
                    pending.push(path);
                }
            } else if stat.is_file() {
                files.push(RemoteEntry::file(
                    path.to_string_lossy().into_owned(),
                    stat.size.unwrap_or(0),
                ));
            }
        }
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

const OUTPUT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Move whatever `reader` has buffered into `out` without blocking.
/// Returns whether any bytes arrived.
fn read_available<R: Read>(reader: &mut R, out: &mut Vec<u8>, buf: &mut [u8]) -> std::io::Result<bool> {
    let mut progressed = false;
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(progressed),
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(progressed),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Drain stdout and stderr in turn until `at_eof` reports the channel is done
/// and a final pass reads nothing. Reading one stream to completion first can
/// deadlock once the other fills the channel window.
fn drain_streams<O, E, F>(stdout: &mut O, stderr: &mut E, at_eof: F) -> std::io::Result<(Vec<u8>, Vec<u8>)>
where
    O: Read,
    E: Read,
    F: Fn() -> bool,
{
    let mut out = Vec::new();
    let mut err = Vec::new();
    let mut buf = vec![0u8; 32 * 1024];

    loop {
        let mut progressed = read_available(stdout, &mut out, &mut buf)?;
        progressed |= read_available(stderr, &mut err, &mut buf)?;
        if !progressed {
            if at_eof() {
                return Ok((out, err));
            }
            std::thread::sleep(OUTPUT_POLL_INTERVAL);
        }
    }
}

fn read_command_output(session: &Session, channel: &mut Channel) -> Result<(String, String)> {
    let mut stderr = channel.stderr();
    session.set_blocking(false);
    let drained = {
        let status = channel.clone();
        drain_streams(channel, &mut stderr, || status.eof())
    };
    session.set_blocking(true);

    let (stdout, stderr) = drained?;
    Ok((
        String::from_utf8_lossy(&stdout).into_owned(),
        String::from_utf8_lossy(&stderr).into_owned(),
    ))
}

/// Stream `reader` into a new file at `local`. A failed copy removes the
/// partial file so no truncated artifact is left behind.
fn copy_to_local<R: Read>(reader: &mut R, local: &Path) -> std::io::Result<u64> {
    let mut file = std::fs::File::create(local)?;
    match std::io::copy(reader, &mut file) {
        Ok(bytes) => Ok(bytes),
        Err(e) => {
            drop(file);
            if let Err(cleanup) = std::fs::remove_file(local) {
                warn!(path = %local.display(), error = %cleanup, "Failed to remove partial download");
            }
            Err(e)
        }
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let command = command.to_string();
        self.blocking(move |session| {
            let mut channel = session
                .channel_session()
                .map_err(|e| session_error("failed to open channel", e))?;
            channel
                .exec(&command)
                .map_err(|e| session_error(format!("failed to start '{command}'"), e))?;

            let (stdout, stderr) = read_command_output(&session, &mut channel)?;

            channel
                .wait_close()
                .map_err(|e| session_error("failed to close channel", e))?;
            let exit_status = channel
                .exit_status()
                .map_err(|e| session_error("failed to read exit status", e))?;

            if exit_status != 0 {
                return Err(BackupError::CommandFailed {
                    command,
                    exit_status: Some(exit_status),
                    stderr: stderr.trim().to_string(),
                });
            }

            Ok(CommandOutput {
                stdout,
                stderr,
                exit_status,
            })
        })
        .await
    }

    async fn list_files(&self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
        let path = path.to_string();
        self.blocking(move |session| collect_files(&sftp(&session)?, &path, recursive))
            .await
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<RemoteEntry>> {
        let path = path.to_string();
        self.blocking(move |session| {
            let sftp = sftp(&session)?;
            let entries = sftp
                .readdir(Path::new(&path))
                .map_err(|e| session_error(format!("cannot list {path}"), e))?;

            let mut listing: Vec<RemoteEntry> = entries
                .into_iter()
                .filter(|(p, _)| !is_dot_entry(p))
                .map(|(p, stat)| {
                    let p = p.to_string_lossy().into_owned();
                    if stat.is_dir() {
                        RemoteEntry::directory(p)
                    } else {
                        RemoteEntry::file(p, stat.size.unwrap_or(0))
                    }
                })
                .collect();
            listing.sort_by(|a, b| a.path.cmp(&b.path));
            Ok(listing)
        })
        .await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64> {
        let remote = remote.to_string();
        let local = local.to_path_buf();
        self.blocking(move |session| {
            let transfer_failed = |source: Box<dyn std::error::Error + Send + Sync>| {
                BackupError::TransferFailed {
                    remote_path: remote.clone(),
                    source,
                }
            };

            let sftp = sftp(&session)?;
            let mut remote_file = sftp
                .open(Path::new(&remote))
                .map_err(|e| transfer_failed(Box::new(e)))?;

            if let Some(parent) = local.parent() {
                std::fs::create_dir_all(parent)?;
            }
            copy_to_local(&mut remote_file, &local).map_err(|e| transfer_failed(Box::new(e)))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.blocking(|session| {
            session
                .disconnect(None, "backup run finished", None)
                .map_err(|e| session_error("failed to disconnect", e))
        })
        .await
    }
}
