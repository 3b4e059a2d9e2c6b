//! Host entity
//!
//! A `Host` is the normalized handle to one provisioned endpoint. It owns at
//! most one session, opened lazily through the `SessionFactory` its provider
//! chose, and a `Releaser` that gives it back to the backend.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use hostbroker_exec::{
    CommandResult, ConnectionInfo, ExecError, Session, SessionFactory, SshSessionFactory, TailFile,
};
use hostbroker_inventory::InventoryEntry;
use hostbroker_inventory::entry::{ARGS, HOST_TYPE, HOSTNAME, NAME, PROVIDER, PROVIDER_INSTANCE};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::error::BrokerError;
use crate::provider::{ProviderView, Releaser, Unreleasable};
use crate::settings::SshSettings;
use crate::timeout::non_zero;

/// Logical host type when none is given
pub const DEFAULT_HOST_TYPE: &str = "host";

const USERNAME: &str = "username";
const PORT: &str = "port";
const KEY_FILENAME: &str = "key_filename";
const CONNECTION_TIMEOUT: &str = "connection_timeout";

/// A provisioned endpoint
pub struct Host {
    hostname: Option<String>,
    name: Option<String>,
    ssh: SshSettings,
    username: Option<String>,
    password: Option<String>,
    key_filename: Option<PathBuf>,
    port: Option<u16>,
    connection_timeout: Option<Duration>,
    extras: Map<String, Value>,
    provider: Option<ProviderView>,
    args: Map<String, Value>,
    host_type: String,
    releaser: Arc<dyn Releaser>,
    session_factory: Arc<dyn SessionFactory>,
    session: Mutex<Option<Arc<dyn Session>>>,
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("hostname", &self.hostname)
            .field("name", &self.name)
            .field("username", &self.username())
            .field("port", &self.port())
            .field("provider", &self.provider)
            .field("type", &self.host_type)
            .field("session_factory", &self.session_factory.kind())
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.identifier())
    }
}

impl Host {
    /// Start building a host at `hostname`
    pub fn builder(hostname: impl Into<String>) -> HostBuilder {
        HostBuilder::new(Some(hostname.into()))
    }

    /// Rebuild a host from an inventory record
    ///
    /// This is the only way to get a host without a hostname. Connection
    /// overrides stored in the record are restored; the password never is.
    #[must_use]
    pub fn from_record(record: InventoryEntry, ssh: SshSettings) -> Self {
        let mut map = record.into_map();
        let take_str = |map: &mut Map<String, Value>, key: &str| match map.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        };

        let hostname = take_str(&mut map, HOSTNAME);
        let name = take_str(&mut map, NAME);
        let provider = take_str(&mut map, PROVIDER).map(|provider_name| {
            ProviderView::new(provider_name, take_str(&mut map, PROVIDER_INSTANCE))
        });
        map.remove(PROVIDER_INSTANCE);
        let host_type = take_str(&mut map, HOST_TYPE).unwrap_or_else(|| DEFAULT_HOST_TYPE.into());
        let args = match map.remove(ARGS) {
            Some(Value::Object(args)) => args,
            _ => Map::new(),
        };
        let username = take_str(&mut map, USERNAME);
        let key_filename = take_str(&mut map, KEY_FILENAME).map(PathBuf::from);
        let port = map
            .remove(PORT)
            .and_then(|v| v.as_u64())
            .and_then(|p| u16::try_from(p).ok());
        let connection_timeout = map
            .remove(CONNECTION_TIMEOUT)
            .and_then(|v| v.as_u64())
            .map(Duration::from_secs);

        let mut builder = HostBuilder::new(hostname)
            .with_ssh_defaults(ssh)
            .with_args(args)
            .with_type(host_type)
            .with_extras(map);
        builder.name = name;
        builder.provider = provider;
        builder.username = username;
        builder.key_filename = key_filename;
        builder.port = port;
        builder.connection_timeout = connection_timeout;
        builder.build()
    }

    /// Replace the release capability
    #[must_use]
    pub fn with_releaser(mut self, releaser: Arc<dyn Releaser>) -> Self {
        self.releaser = releaser;
        self
    }

    /// Replace how sessions are opened
    #[must_use]
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factory = factory;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Host address
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    /// Backend-side name
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Hostname, falling back to name
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.hostname
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or("<unnamed>")
    }

    /// Whether `id` is this host's hostname or name
    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        self.hostname() == Some(id) || self.name() == Some(id)
    }

    /// Login user
    #[must_use]
    pub fn username(&self) -> &str {
        self.username.as_deref().unwrap_or(&self.ssh.host_username)
    }

    /// SSH port
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(self.ssh.host_ssh_port)
    }

    /// Private key file
    #[must_use]
    pub fn key_filename(&self) -> Option<&Path> {
        self.key_filename
            .as_deref()
            .or(self.ssh.host_ssh_key_filename.as_deref())
    }

    /// Connection timeout; a per-host value wins over `[ssh]`
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        self.connection_timeout
            .unwrap_or_else(|| self.ssh.connection_timeout())
    }

    /// Provider that built this host
    #[must_use]
    pub fn provider(&self) -> Option<&ProviderView> {
        self.provider.as_ref()
    }

    /// Arguments the host was checked out with
    #[must_use]
    pub fn args(&self) -> &Map<String, Value> {
        &self.args
    }

    /// Logical host type
    #[must_use]
    pub fn host_type(&self) -> &str {
        &self.host_type
    }

    /// Provider-specific data
    #[must_use]
    pub fn extras(&self) -> &Map<String, Value> {
        &self.extras
    }

    /// One provider-specific value
    #[must_use]
    pub fn extra(&self, key: &str) -> Option<&Value> {
        self.extras.get(key)
    }

    /// Connection parameters for the session factory
    ///
    /// # Errors
    /// Returns `BrokerError::Host` if the host has no hostname
    pub fn connection_info(&self) -> Result<ConnectionInfo, BrokerError> {
        let hostname = self.hostname.as_deref().ok_or_else(|| BrokerError::Host {
            host: self.identifier().to_string(),
            message: "host has no hostname to connect to".to_string(),
        })?;

        let mut conn = ConnectionInfo::new(hostname, self.username())
            .with_port(self.port())
            .with_connection_timeout(self.connection_timeout());
        if let Some(key) = self.key_filename() {
            conn = conn.with_key_filename(key);
        } else if let Some(password) = self.password.as_ref().or(self.ssh.host_password.as_ref()) {
            conn = conn.with_password(password.clone());
        }
        Ok(conn)
    }

    // ========================================================================
    // Inventory projection
    // ========================================================================

    /// Inventory record for this host; never includes the session or password
    #[must_use]
    pub fn to_record(&self) -> InventoryEntry {
        let mut map = self.extras.clone();
        if let Some(hostname) = &self.hostname {
            map.insert(HOSTNAME.into(), hostname.clone().into());
        }
        if let Some(name) = &self.name {
            map.insert(NAME.into(), name.clone().into());
        }
        if let Some(provider) = &self.provider {
            map.insert(PROVIDER.into(), provider.name.clone().into());
            if let Some(instance) = &provider.instance {
                map.insert(PROVIDER_INSTANCE.into(), instance.clone().into());
            }
        }
        map.insert(ARGS.into(), Value::Object(self.args.clone()));
        map.insert(HOST_TYPE.into(), self.host_type.clone().into());
        if let Some(username) = &self.username {
            map.insert(USERNAME.into(), username.clone().into());
        }
        if let Some(port) = self.port {
            map.insert(PORT.into(), port.into());
        }
        if let Some(timeout) = self.connection_timeout {
            map.insert(CONNECTION_TIMEOUT.into(), timeout.as_secs().into());
        }
        if let Some(key) = &self.key_filename {
            map.insert(KEY_FILENAME.into(), key.to_string_lossy().into_owned().into());
        }
        InventoryEntry::from(map)
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// The live session, opened on first use
    ///
    /// # Errors
    /// Returns `BrokerError::Host` if the connection cannot be established
    pub async fn session(&self) -> Result<Arc<dyn Session>, BrokerError> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref()
            && session.is_connected()
        {
            return Ok(session.clone());
        }

        let conn = self.connection_info()?;
        debug!(host = %self, factory = self.session_factory.kind(), "opening session");
        let session = self
            .session_factory
            .open(&conn)
            .await
            .map_err(|e| BrokerError::Host {
                host: self.identifier().to_string(),
                message: e.to_string(),
            })?;
        *guard = Some(session.clone());
        Ok(session)
    }

    /// Open the session now rather than on first command
    ///
    /// # Errors
    /// Returns `BrokerError::Host` if the connection cannot be established
    pub async fn connect(&self) -> Result<(), BrokerError> {
        self.session().await.map(|_| ())
    }

    /// Whether a live session is held
    pub async fn is_connected(&self) -> bool {
        self.session
            .lock()
            .await
            .as_ref()
            .is_some_and(|s| s.is_connected())
    }

    /// Run a command; `None` or a zero timeout waits indefinitely
    ///
    /// A stale connection is discarded and the command retried once on a
    /// fresh session.
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if the command cannot be run
    #[instrument(skip(self), fields(host = %self))]
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult, BrokerError> {
        let timeout = timeout.and_then(non_zero);
        let session = self.session().await?;
        match run(session.as_ref(), command, timeout).await {
            Err(e) if e.is_stale() => {
                warn!(host = %self, error = %e, "stale session, reconnecting");
                self.discard_session().await;
                let session = self.session().await?;
                Ok(run(session.as_ref(), command, timeout).await?)
            }
            result => Ok(result?),
        }
    }

    async fn discard_session(&self) {
        let stale = self.session.lock().await.take();
        if let Some(session) = stale
            && let Err(e) = session.disconnect().await
        {
            debug!(host = %self, error = %e, "ignoring disconnect failure on stale session");
        }
    }

    /// Close the session; calling this more than once is a no-op
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if the transport fails to disconnect
    pub async fn close(&self) -> Result<(), BrokerError> {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.disconnect().await?;
            debug!(host = %self, "session closed");
        }
        Ok(())
    }

    /// Give the host back to its provider
    ///
    /// # Errors
    /// Whatever the bound releaser returns; `NotImplemented` by default
    pub async fn release(&self) -> Result<Value, BrokerError> {
        info!(host = %self, "releasing host");
        self.releaser.release(self).await
    }

    // ========================================================================
    // Files and shells
    // ========================================================================

    /// Read a remote file
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if the transfer fails
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, BrokerError> {
        Ok(self.session().await?.read_file(path).await?)
    }

    /// Write a remote file
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if the transfer fails
    pub async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), BrokerError> {
        Ok(self.session().await?.write_file(path, contents).await?)
    }

    /// Copy a remote file to a local path
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if either side of the copy fails
    pub async fn sftp_read(&self, source: &str, destination: &Path) -> Result<(), BrokerError> {
        let data = self.read_file(source).await?;
        if let Some(parent) = destination.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| local_io(destination, &e))?;
        }
        tokio::fs::write(destination, data)
            .await
            .map_err(|e| local_io(destination, &e))?;
        debug!(host = %self, source, destination = %destination.display(), "copied file from host");
        Ok(())
    }

    /// Copy a local file to a remote path
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if either side of the copy fails
    pub async fn sftp_write(&self, source: &Path, destination: &str) -> Result<(), BrokerError> {
        let data = tokio::fs::read(source)
            .await
            .map_err(|e| local_io(source, &e))?;
        self.write_file(destination, &data).await?;
        debug!(host = %self, source = %source.display(), destination, "copied file to host");
        Ok(())
    }

    /// Same as `sftp_read`; both go over the session's byte-exact channel
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if either side of the copy fails
    pub async fn scp_read(&self, source: &str, destination: &Path) -> Result<(), BrokerError> {
        self.sftp_read(source, destination).await
    }

    /// Same as `sftp_write`
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if either side of the copy fails
    pub async fn scp_write(&self, source: &Path, destination: &str) -> Result<(), BrokerError> {
        self.sftp_write(source, destination).await
    }

    /// Start recording what gets appended to `path`
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if the file size cannot be read
    pub async fn tail_file(&self, path: impl Into<String>) -> Result<TailFile, BrokerError> {
        Ok(TailFile::start(self.session().await?, path).await?)
    }

    /// Shell handle; lines sent are replayed into a real shell on `finish`
    ///
    /// # Errors
    /// Returns `BrokerError::Host` if the connection cannot be established
    pub async fn shell(&self, pty: bool) -> Result<HostShell, BrokerError> {
        Ok(HostShell {
            session: self.session().await?,
            pty,
            lines: Vec::new(),
        })
    }
}

async fn run(
    session: &dyn Session,
    command: &str,
    timeout: Option<Duration>,
) -> Result<CommandResult, ExecError> {
    match timeout {
        Some(timeout) => session.run_with_timeout(command, timeout).await,
        None => session.run(command).await,
    }
}

fn local_io(path: &Path, err: &std::io::Error) -> BrokerError {
    BrokerError::Session(ExecError::Transfer {
        path: path.display().to_string(),
        message: err.to_string(),
    })
}

/// Interactive shell on a host
#[derive(Debug)]
pub struct HostShell {
    session: Arc<dyn Session>,
    pty: bool,
    lines: Vec<String>,
}

impl HostShell {
    /// Queue text for the shell
    pub fn send(&mut self, text: impl Into<String>) -> &mut Self {
        self.lines.push(text.into());
        self
    }

    /// Run everything sent and return what the shell printed
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if the shell cannot be opened or driven
    pub async fn finish(self) -> Result<CommandResult, BrokerError> {
        let mut shell = self.session.shell(self.pty).await?;
        for line in &self.lines {
            shell.send(line).await?;
        }
        Ok(shell.finish().await?)
    }

    /// Run everything sent and return only stdout
    ///
    /// # Errors
    /// Returns `BrokerError::Session` if the shell cannot be opened or driven
    pub async fn stdout(self) -> Result<String, BrokerError> {
        Ok(self.finish().await?.stdout)
    }
}

/// Builder for `Host`
pub struct HostBuilder {
    hostname: Option<String>,
    name: Option<String>,
    ssh: SshSettings,
    username: Option<String>,
    password: Option<String>,
    key_filename: Option<PathBuf>,
    port: Option<u16>,
    connection_timeout: Option<Duration>,
    extras: Map<String, Value>,
    provider: Option<ProviderView>,
    args: Map<String, Value>,
    host_type: String,
    releaser: Arc<dyn Releaser>,
    session_factory: Arc<dyn SessionFactory>,
}

impl HostBuilder {
    fn new(hostname: Option<String>) -> Self {
        Self {
            hostname,
            name: None,
            ssh: SshSettings::default(),
            username: None,
            password: None,
            key_filename: None,
            port: None,
            connection_timeout: None,
            extras: Map::new(),
            provider: None,
            args: Map::new(),
            host_type: DEFAULT_HOST_TYPE.to_string(),
            releaser: Arc::new(Unreleasable),
            session_factory: Arc::new(SshSessionFactory),
        }
    }

    /// Backend-side name
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Connection defaults for anything not set explicitly
    #[must_use]
    pub fn with_ssh_defaults(mut self, ssh: SshSettings) -> Self {
        self.ssh = ssh;
        self
    }

    /// Login user
    #[must_use]
    pub fn with_username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Login password; never persisted
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Private key file
    #[must_use]
    pub fn with_key_filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_filename = Some(path.into());
        self
    }

    /// SSH port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Time allowed to connect to this host, overriding `[ssh]`
    ///
    /// Persisted in whole seconds.
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = Some(timeout);
        self
    }

    /// One provider-specific value
    #[must_use]
    pub fn with_extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extras.insert(key.into(), value.into());
        self
    }

    /// Provider-specific values
    ///
    /// A `name` key becomes the host name.
    #[must_use]
    pub fn with_extras(mut self, extras: Map<String, Value>) -> Self {
        for (key, value) in extras {
            if key == NAME {
                if let Value::String(name) = value {
                    self.name = Some(name);
                }
                continue;
            }
            self.extras.insert(key, value);
        }
        self
    }

    /// Provider identity
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderView) -> Self {
        self.provider = Some(provider);
        self
    }

    /// Checkout arguments
    #[must_use]
    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args = args;
        self
    }

    /// Logical host type
    #[must_use]
    pub fn with_type(mut self, host_type: impl Into<String>) -> Self {
        self.host_type = host_type.into();
        self
    }

    /// Release capability
    #[must_use]
    pub fn with_releaser(mut self, releaser: Arc<dyn Releaser>) -> Self {
        self.releaser = releaser;
        self
    }

    /// How sessions are opened
    #[must_use]
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.session_factory = factory;
        self
    }

    /// Finish the host
    #[must_use]
    pub fn build(self) -> Host {
        Host {
            hostname: self.hostname,
            name: self.name,
            ssh: self.ssh,
            username: self.username,
            password: self.password,
            key_filename: self.key_filename,
            port: self.port,
            connection_timeout: self.connection_timeout,
            extras: self.extras,
            provider: self.provider,
            args: self.args,
            host_type: self.host_type,
            releaser: self.releaser,
            session_factory: self.session_factory,
            session: Mutex::new(None),
        }
    }
}

// ============================================================================
// Host classes
// ============================================================================

/// Hook run against a host
pub type HostHook =
    Arc<dyn for<'a> Fn(&'a Host) -> BoxFuture<'a, Result<(), BrokerError>> + Send + Sync>;

/// Wrap an async closure as a `HostHook`
pub fn host_hook<F>(hook: F) -> HostHook
where
    F: for<'a> Fn(&'a Host) -> BoxFuture<'a, Result<(), BrokerError>> + Send + Sync + 'static,
{
    Arc::new(hook)
}

/// Setup/teardown behaviour for one logical host type
#[derive(Clone, Default)]
pub struct HostClass {
    setup: Option<HostHook>,
    teardown: Option<HostHook>,
}

impl fmt::Debug for HostClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostClass")
            .field("setup", &self.setup.is_some())
            .field("teardown", &self.teardown.is_some())
            .finish()
    }
}

impl HostClass {
    /// Class with no hooks
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `hook` after checkout
    #[must_use]
    pub fn with_setup(mut self, hook: HostHook) -> Self {
        self.setup = Some(hook);
        self
    }

    /// Run `hook` before checkin
    #[must_use]
    pub fn with_teardown(mut self, hook: HostHook) -> Self {
        self.teardown = Some(hook);
        self
    }

    /// Run the setup hook, if any
    ///
    /// # Errors
    /// Whatever the hook returns
    pub async fn setup(&self, host: &Host) -> Result<(), BrokerError> {
        match &self.setup {
            Some(hook) => hook(host).await,
            None => Ok(()),
        }
    }

    /// Run the teardown hook, if any
    ///
    /// # Errors
    /// Whatever the hook returns
    pub async fn teardown(&self, host: &Host) -> Result<(), BrokerError> {
        match &self.teardown {
            Some(hook) => hook(host).await,
            None => Ok(()),
        }
    }
}

/// Host classes keyed by logical type
#[derive(Debug, Clone, Default)]
pub struct HostClasses {
    classes: HashMap<String, HostClass>,
}

impl HostClasses {
    /// Empty registry; every type gets the no-op class
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `class` for `host_type`
    #[must_use]
    pub fn with_class(mut self, host_type: impl Into<String>, class: HostClass) -> Self {
        self.classes.insert(host_type.into(), class);
        self
    }

    /// Class for `host`, if one is registered for its type
    #[must_use]
    pub fn for_host(&self, host: &Host) -> Option<&HostClass> {
        self.classes.get(host.host_type())
    }
}
