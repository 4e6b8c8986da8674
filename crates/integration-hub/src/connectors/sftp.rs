//! Blocking SFTP client on top of libssh2
//!
//! Every call blocks the current thread. Async callers run the whole session
//! inside `tokio::task::spawn_blocking` (see
//! [`SftpDestination`](super::destination::SftpDestination)).
//!
//! # Example
//!
//! ```rust,ignore
//! let mut client = SftpClient::new(SftpConfig::new("sftp.partner.example", 22), credentials);
//! client.connect()?;
//! client.upload_bytes(b"id,amount\n1,20.00\n", "/inbox/claims.csv")?;
//! for file in client.list_files("/outbox", Some(&FilePattern::new("*.csv")?))? {
//!     let bytes = client.download_bytes(&file.path)?;
//! }
//! client.disconnect();
//! ```

use super::credentials::SshCredentials;
use super::pattern::FilePattern;
use crate::error::{IntegrationError, Result};
use chrono::{DateTime, TimeZone, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use ssh2::{CheckResult, KnownHostFileKind, RenameFlags, Session, Sftp};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

fn default_port() -> u16 {
    22
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

fn default_strict_host_key() -> bool {
    true
}

/// Connection settings for an SFTP server
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Reject hosts missing from `known_hosts_path`
    #[serde(default = "default_strict_host_key")]
    pub strict_host_key_checking: bool,
    #[serde(default)]
    pub known_hosts_path: Option<PathBuf>,
}

impl SftpConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout_ms: default_connect_timeout_ms(),
            strict_host_key_checking: false,
            known_hosts_path: None,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_known_hosts(mut self, path: impl Into<PathBuf>, strict: bool) -> Self {
        self.known_hosts_path = Some(path.into());
        self.strict_host_key_checking = strict;
        self
    }

    fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Entry returned by [`SftpClient::list_files`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteFile {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

struct Connection {
    session: Session,
    sftp: Sftp,
}

pub struct SftpClient {
    config: SftpConfig,
    credentials: SshCredentials,
    connection: Option<Connection>,
}

impl std::fmt::Debug for SftpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpClient")
            .field("address", &self.config.address())
            .field("username", &self.credentials.username)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl SftpClient {
    pub fn new(config: SftpConfig, credentials: SshCredentials) -> Self {
        Self {
            config,
            credentials,
            connection: None,
        }
    }

    pub fn config(&self) -> &SftpConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connection
            .as_ref()
            .is_some_and(|c| c.session.authenticated())
    }

    /// Open the TCP connection, verify the host key and authenticate
    pub fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let address = self.config.address();
        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connect_error = |msg: String| IntegrationError::connection(format!("{}: {}", address, msg));

        let socket = address
            .to_socket_addrs()
            .map_err(|e| connect_error(e.to_string()))?
            .next()
            .ok_or_else(|| connect_error("host did not resolve".to_string()))?;
        let tcp = TcpStream::connect_timeout(&socket, timeout).map_err(|e| connect_error(e.to_string()))?;

        let mut session = Session::new().map_err(|e| connect_error(e.to_string()))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(self.config.connect_timeout_ms.min(u32::MAX as u64) as u32);
        session.handshake().map_err(|e| connect_error(e.to_string()))?;

        self.verify_host_key(&session)?;
        self.authenticate(&session)?;

        let sftp = session.sftp().map_err(|e| connect_error(e.to_string()))?;
        info!("Connected to SFTP server {} as {}", address, self.credentials.username);
        self.connection = Some(Connection { session, sftp });
        Ok(())
    }

    fn verify_host_key(&self, session: &Session) -> Result<()> {
        let Some(path) = &self.config.known_hosts_path else {
            if self.config.strict_host_key_checking {
                return Err(IntegrationError::connection(
                    "strict host key checking requires known_hosts_path",
                ));
            }
            warn!("Host key of {} not verified (no known_hosts configured)", self.config.host);
            return Ok(());
        };

        let mut known_hosts = session
            .known_hosts()
            .map_err(|e| IntegrationError::connection(e.to_string()))?;
        known_hosts
            .read_file(path, KnownHostFileKind::OpenSSH)
            .map_err(|e| IntegrationError::connection(format!("known hosts {}: {}", path.display(), e)))?;
        let (key, _) = session
            .host_key()
            .ok_or_else(|| IntegrationError::connection("server sent no host key"))?;

        match known_hosts.check_port(&self.config.host, self.config.port, key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound if !self.config.strict_host_key_checking => {
                warn!("Host {} not in known hosts, continuing", self.config.host);
                Ok(())
            }
            CheckResult::NotFound => Err(IntegrationError::connection(format!(
                "host {} not found in {}",
                self.config.host,
                path.display()
            ))),
            CheckResult::Mismatch => Err(IntegrationError::connection(format!(
                "host key mismatch for {}",
                self.config.host
            ))),
            CheckResult::Failure => Err(IntegrationError::connection("host key check failed")),
        }
    }

    fn authenticate(&self, session: &Session) -> Result<()> {
        let username = &self.credentials.username;
        let result = match (&self.credentials.private_key_path, &self.credentials.password) {
            (Some(key), _) => session.userauth_pubkey_file(
                username,
                None,
                key,
                self.credentials.passphrase.as_ref().map(|p| p.expose_secret()),
            ),
            (None, Some(password)) => session.userauth_password(username, password.expose_secret()),
            (None, None) => {
                return Err(IntegrationError::CredentialsNotFound(format!(
                    "no password or private key for SSH user '{}'",
                    username
                )))
            }
        };
        result.map_err(|e| IntegrationError::connection(format!("authentication failed for '{}': {}", username, e)))?;
        if !session.authenticated() {
            return Err(IntegrationError::connection(format!(
                "authentication failed for '{}'",
                username
            )));
        }
        Ok(())
    }

    pub fn disconnect(&mut self) {
        if let Some(connection) = self.connection.take() {
            drop(connection.sftp);
            if let Err(e) = connection.session.disconnect(None, "bye", None) {
                debug!("SFTP disconnect from {} failed: {}", self.config.host, e);
            }
            info!("Disconnected from SFTP server {}", self.config.address());
        }
    }

    fn sftp(&self) -> Result<&Sftp> {
        match &self.connection {
            Some(connection) => Ok(&connection.sftp),
            None => Err(IntegrationError::illegal_state(format!(
                "not connected to SFTP server {}",
                self.config.address()
            ))),
        }
    }

    fn read_error(&self, path: &str, e: impl std::fmt::Display) -> IntegrationError {
        IntegrationError::read(format!("sftp://{}{}", self.config.host, path), e.to_string())
    }

    fn write_error(&self, path: &str, e: impl std::fmt::Display) -> IntegrationError {
        IntegrationError::send(format!("sftp://{}{}", self.config.host, path), e.to_string(), 1)
    }

    /// Upload a local file, creating the remote directory first
    pub fn upload(&self, local: &Path, remote: &str) -> Result<()> {
        let bytes = std::fs::read(local)?;
        self.upload_bytes(&bytes, remote)
    }

    /// Write `bytes` to a remote file, creating its directory first
    pub fn upload_bytes(&self, bytes: &[u8], remote: &str) -> Result<()> {
        let sftp = self.sftp()?;
        if let Some(parent) = parent_dir(remote) {
            self.mkdirs(&parent)?;
        }
        let mut file = sftp
            .create(Path::new(remote))
            .map_err(|e| self.write_error(remote, e))?;
        file.write_all(bytes).map_err(|e| self.write_error(remote, e))?;
        debug!("Uploaded {} bytes to {}", bytes.len(), remote);
        Ok(())
    }

    /// Download a remote file to a local path
    pub fn download(&self, remote: &str, local: &Path) -> Result<()> {
        let bytes = self.download_bytes(remote)?;
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, bytes)?;
        Ok(())
    }

    pub fn download_bytes(&self, remote: &str) -> Result<Vec<u8>> {
        let sftp = self.sftp()?;
        let mut file = sftp
            .open(Path::new(remote))
            .map_err(|e| self.read_error(remote, e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| self.read_error(remote, e))?;
        debug!("Downloaded {} bytes from {}", bytes.len(), remote);
        Ok(bytes)
    }

    /// Regular files in `dir` whose names match `pattern`, sorted by name
    pub fn list_files(&self, dir: &str, pattern: Option<&FilePattern>) -> Result<Vec<RemoteFile>> {
        let sftp = self.sftp()?;
        let entries = sftp
            .readdir(Path::new(dir))
            .map_err(|e| self.read_error(dir, e))?;

        let mut files: Vec<RemoteFile> = entries
            .into_iter()
            .filter(|(_, stat)| stat.is_file())
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                if pattern.is_some_and(|p| !p.matches(&name)) {
                    return None;
                }
                Some(RemoteFile {
                    path: join_remote(dir, &name),
                    name,
                    size: stat.size.unwrap_or(0),
                    modified: stat
                        .mtime
                        .and_then(|t| Utc.timestamp_opt(t as i64, 0).single()),
                })
            })
            .collect();
        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    pub fn exists(&self, remote: &str) -> Result<bool> {
        Ok(self.sftp()?.stat(Path::new(remote)).is_ok())
    }

    /// Create `dir` and any missing parents
    pub fn mkdirs(&self, dir: &str) -> Result<()> {
        let sftp = self.sftp()?;
        let mut current = String::new();
        for part in dir.split('/').filter(|p| !p.is_empty()) {
            if dir.starts_with('/') || !current.is_empty() {
                current.push('/');
            }
            current.push_str(part);
            let path = Path::new(&current);
            if sftp.stat(path).is_err() {
                sftp.mkdir(path, 0o755)
                    .map_err(|e| self.write_error(&current, e))?;
                debug!("Created remote directory {}", current);
            }
        }
        Ok(())
    }

    pub fn delete(&self, remote: &str) -> Result<()> {
        self.sftp()?
            .unlink(Path::new(remote))
            .map_err(|e| self.write_error(remote, e))
    }

    /// Rename, replacing an existing target
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let sftp = self.sftp()?;
        replace_file(sftp, Path::new(from), Path::new(to)).map_err(|e| self.write_error(to, e))
    }
}

/// Remote calls needed to replace one file with another
trait RemoteRename {
    fn try_rename(&self, from: &Path, to: &Path, flags: Option<RenameFlags>) -> std::result::Result<(), String>;
    fn is_present(&self, path: &Path) -> bool;
    fn remove(&self, path: &Path) -> std::result::Result<(), String>;
}

impl RemoteRename for Sftp {
    fn try_rename(&self, from: &Path, to: &Path, flags: Option<RenameFlags>) -> std::result::Result<(), String> {
        self.rename(from, to, flags).map_err(|e| e.to_string())
    }

    fn is_present(&self, path: &Path) -> bool {
        self.stat(path).is_ok()
    }

    fn remove(&self, path: &Path) -> std::result::Result<(), String> {
        self.unlink(path).map_err(|e| e.to_string())
    }
}

/// Atomic overwriting rename. Servers that refuse to overwrite get the target
/// unlinked first, and only while the source is still there.
fn replace_file(remote: &impl RemoteRename, from: &Path, to: &Path) -> std::result::Result<(), String> {
    let flags = RenameFlags::OVERWRITE | RenameFlags::ATOMIC | RenameFlags::NATIVE;
    match remote.try_rename(from, to, Some(flags)) {
        Ok(()) => Ok(()),
        Err(e) if !remote.is_present(to) || !remote.is_present(from) => Err(e),
        Err(e) => {
            debug!("Server refused to overwrite {} ({}), replacing it", to.display(), e);
            remote.remove(to)?;
            remote.try_rename(from, to, None)
        }
    }
}

impl Drop for SftpClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn parent_dir(remote: &str) -> Option<String> {
    let trimmed = remote.trim_end_matches('/');
    let index = trimmed.rfind('/')?;
    match &trimmed[..index] {
        "" => None,
        parent => Some(parent.to_string()),
    }
}

pub(crate) fn join_remote(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir.trim_end_matches('/'), name)
    }
}
