//! SSH sessions using the russh crate

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use russh::keys::ssh_key;
use russh::keys::{PrivateKeyWithHashAlg, load_secret_key};
use russh::{Channel, ChannelMsg, Disconnect, client};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::error::ExecError;
use crate::keys::{KeySource, ResolvedKey};
use crate::result::{CommandResult, ConnectionInfo};
use crate::session::{InteractiveShell, Session, SessionFactory, quote};

#[derive(Debug)]
struct SshClientHandler;

impl client::Handler for SshClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // Provisioned hosts are fresh; there is no known_hosts entry to check against.
        Ok(true)
    }
}

/// Output gathered from one channel
struct ChannelOutput {
    status: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

async fn collect(channel: &mut Channel<client::Msg>) -> ChannelOutput {
    let mut output = ChannelOutput {
        status: -1,
        stdout: Vec::new(),
        stderr: Vec::new(),
    };

    // the exit status may arrive after EOF, so read until the channel closes
    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { data } => output.stdout.extend_from_slice(&data),
            ChannelMsg::ExtendedData { data, ext } if ext == 1 => {
                output.stderr.extend_from_slice(&data);
            }
            ChannelMsg::ExitStatus { exit_status } => output.status = exit_status.cast_signed(),
            _ => {}
        }
    }

    output
}

/// SSH session to one host
///
/// The connection is established on first use and kept until `disconnect`.
/// A failure to open a channel on a cached connection drops it and reports
/// `ExecError::ConnectionLost`, so callers can reconnect and retry.
pub struct SshSession {
    conn_info: ConnectionInfo,
    key: ResolvedKey,
    handle: Mutex<Option<client::Handle<SshClientHandler>>>,
    connected: AtomicBool,
}

impl std::fmt::Debug for SshSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSession")
            .field("conn_info", &self.conn_info)
            .field("key", &self.key)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

impl SshSession {
    /// Create a new SSH session
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn new(conn_info: ConnectionInfo) -> Result<Self, ExecError> {
        let source = conn_info
            .key_filename
            .clone()
            .map_or(KeySource::None, KeySource::Path);
        Self::with_key_source(conn_info, &source)
    }

    /// Create a session with an explicit key source
    ///
    /// # Errors
    /// Returns `ExecError::SshKeyError` if key resolution fails
    pub fn with_key_source(
        conn_info: ConnectionInfo,
        key_source: &KeySource,
    ) -> Result<Self, ExecError> {
        let key = key_source
            .resolve()
            .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

        Ok(Self {
            conn_info,
            key,
            handle: Mutex::new(None),
            connected: AtomicBool::new(false),
        })
    }

    /// Get connection info
    #[must_use]
    pub fn connection_info(&self) -> &ConnectionInfo {
        &self.conn_info
    }

    /// Connect and authenticate, if not already connected
    ///
    /// # Errors
    /// Returns `ExecError::ConnectionFailed` or `ExecError::AuthenticationFailed`
    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    pub async fn connect(&self) -> Result<(), ExecError> {
        let mut handle_lock = self.handle.lock().await;

        if handle_lock.as_ref().is_some_and(|h| !h.is_closed()) {
            return Ok(());
        }

        info!(
            host = %self.conn_info.host,
            port = self.conn_info.port,
            user = %self.conn_info.user,
            "connecting to SSH"
        );

        let config = Arc::new(client::Config::default());
        let connect = client::connect(
            config,
            (&self.conn_info.host[..], self.conn_info.port),
            SshClientHandler,
        );
        let mut handle = timeout(self.conn_info.connection_timeout, connect)
            .await
            .map_err(|_| {
                ExecError::ConnectionFailed(format!(
                    "timed out after {:?}",
                    self.conn_info.connection_timeout
                ))
            })?
            .map_err(|e| ExecError::ConnectionFailed(e.to_string()))?;

        if let Some(key_path) = self.key.path() {
            let key_pair = load_secret_key(key_path, None)
                .map_err(|e| ExecError::SshKeyError(e.to_string()))?;

            let hash_alg = handle
                .best_supported_rsa_hash()
                .await
                .ok()
                .flatten()
                .flatten();
            let auth_res = handle
                .authenticate_publickey(
                    &self.conn_info.user,
                    PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg),
                )
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

            if !auth_res.success() {
                return Err(ExecError::AuthenticationFailed(
                    "public key authentication failed".to_string(),
                ));
            }
        } else if let Some(password) = &self.conn_info.password {
            let auth_res = handle
                .authenticate_password(&self.conn_info.user, password)
                .await
                .map_err(|e| ExecError::AuthenticationFailed(e.to_string()))?;

            if !auth_res.success() {
                return Err(ExecError::AuthenticationFailed(
                    "password authentication failed".to_string(),
                ));
            }
        } else {
            return Err(ExecError::AuthenticationFailed(
                "no key or password configured".to_string(),
            ));
        }

        info!(host = %self.conn_info.host, "SSH connected and authenticated");

        *handle_lock = Some(handle);
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    /// Open a fresh channel, dropping the cached connection if it is dead
    async fn open_channel(&self) -> Result<Channel<client::Msg>, ExecError> {
        let mut handle_lock = self.handle.lock().await;
        let handle = handle_lock.as_mut().ok_or(ExecError::NotConnected)?;

        match handle.channel_open_session().await {
            Ok(channel) => Ok(channel),
            Err(e) => {
                warn!(host = %self.conn_info.host, error = %e, "SSH connection went stale");
                *handle_lock = None;
                self.connected.store(false, Ordering::Release);
                Err(ExecError::ConnectionLost(e.to_string()))
            }
        }
    }

    #[instrument(skip(self, cmd), fields(host = %self.conn_info.host))]
    async fn execute_remote(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        debug!(command = %cmd, "executing remote command");

        let start = Instant::now();
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, cmd)
            .await
            .map_err(|e| ExecError::ConnectionLost(e.to_string()))?;

        let output = collect(&mut channel).await;
        let duration = start.elapsed();

        debug!(
            command = %cmd,
            status = output.status,
            duration = ?duration,
            "remote command completed"
        );

        Ok(CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration,
        })
    }
}

#[async_trait]
impl Session for SshSession {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.connect().await?;
        self.execute_remote(cmd).await
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        // connecting is bounded by the connection timeout, not the command timeout
        self.connect().await?;

        match timeout(timeout_duration, self.execute_remote(cmd)).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    command = %cmd,
                    timeout = ?timeout_duration,
                    elapsed = ?start.elapsed(),
                    "command timed out"
                );
                Err(ExecError::Timeout {
                    timeout: timeout_duration,
                })
            }
        }
    }

    #[instrument(skip(self), fields(host = %self.conn_info.host))]
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        self.connect().await?;
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, format!("cat {}", quote(path)?))
            .await
            .map_err(|e| ExecError::ConnectionLost(e.to_string()))?;

        let output = collect(&mut channel).await;
        if output.status != 0 {
            return Err(ExecError::Transfer {
                path: path.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(path = %path, bytes = output.stdout.len(), "read remote file");
        Ok(output.stdout)
    }

    #[instrument(skip(self, contents), fields(host = %self.conn_info.host))]
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ExecError> {
        self.connect().await?;
        let mut channel = self.open_channel().await?;
        channel
            .exec(true, format!("cat > {}", quote(path)?))
            .await
            .map_err(|e| ExecError::ConnectionLost(e.to_string()))?;

        let transfer_err = |e: russh::Error| ExecError::Transfer {
            path: path.to_string(),
            message: e.to_string(),
        };
        channel.data(contents).await.map_err(transfer_err)?;
        channel.eof().await.map_err(transfer_err)?;

        let output = collect(&mut channel).await;
        if output.status != 0 {
            return Err(ExecError::Transfer {
                path: path.to_string(),
                message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        debug!(path = %path, bytes = contents.len(), "wrote remote file");
        Ok(())
    }

    async fn shell(&self, pty: bool) -> Result<Box<dyn InteractiveShell + '_>, ExecError> {
        self.connect().await?;
        let channel = self.open_channel().await?;
        if pty {
            channel
                .request_pty(false, "xterm", 80, 24, 0, 0, &[])
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
        }
        channel
            .request_shell(true)
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        Ok(Box::new(SshShell {
            channel,
            started: Instant::now(),
        }))
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        let mut handle_lock = self.handle.lock().await;
        self.connected.store(false, Ordering::Release);

        if let Some(handle) = handle_lock.take() {
            handle
                .disconnect(Disconnect::ByApplication, "", "English")
                .await
                .map_err(|e| ExecError::IoError(e.to_string()))?;
            info!(host = %self.conn_info.host, "SSH disconnected");
        }
        Ok(())
    }

    // set on connect, cleared on disconnect or a stale channel
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    fn session_type(&self) -> &'static str {
        "ssh"
    }
}

/// Interactive shell over an SSH channel
struct SshShell {
    channel: Channel<client::Msg>,
    started: Instant,
}

#[async_trait]
impl InteractiveShell for SshShell {
    async fn send(&mut self, text: &str) -> Result<(), ExecError> {
        let mut line = text.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.channel
            .data(line.as_bytes())
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))
    }

    async fn finish(mut self: Box<Self>) -> Result<CommandResult, ExecError> {
        self.channel
            .eof()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;
        let output = collect(&mut self.channel).await;
        Ok(CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration: self.started.elapsed(),
        })
    }
}

/// Opens connected `SshSession`s
#[derive(Debug, Clone, Default)]
pub struct SshSessionFactory;

#[async_trait]
impl SessionFactory for SshSessionFactory {
    async fn open(&self, conn: &ConnectionInfo) -> Result<Arc<dyn Session>, ExecError> {
        let session = SshSession::new(conn.clone())?;
        session.connect().await?;
        Ok(Arc::new(session))
    }

    fn kind(&self) -> &'static str {
        "ssh"
    }
}
