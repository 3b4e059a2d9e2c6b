//! Session capability traits
//!
//! A `Session` is the live command channel to one host. Hosts never talk to a
//! transport directly; they ask a `SessionFactory` for a session on first use.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::error::ExecError;
use crate::result::{CommandResult, ConnectionInfo};

/// Quote a value for safe inclusion in a `sh -c` command line
///
/// # Errors
/// Returns `ExecError::ConfigError` if the value contains a NUL byte
pub fn quote(value: &str) -> Result<String, ExecError> {
    shlex::try_quote(value)
        .map(|q| q.into_owned())
        .map_err(|e| ExecError::ConfigError(e.to_string()))
}

/// Command channel to a single host
#[async_trait]
pub trait Session: Send + Sync + Debug {
    /// Run a command and wait for it to finish
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    /// Run a command, giving up after `timeout`
    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Read a remote file
    ///
    /// The default goes through `base64` on the remote side so binary content
    /// survives text-only command channels.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        let result = self.run(&format!("base64 {}", quote(path)?)).await?;
        if !result.success() {
            return Err(ExecError::Transfer {
                path: path.to_string(),
                message: result.stderr.trim().to_string(),
            });
        }
        let encoded: String = result.stdout.split_whitespace().collect();
        STANDARD.decode(encoded).map_err(|e| ExecError::Transfer {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    /// Write a remote file, replacing any existing content
    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ExecError> {
        let encoded = STANDARD.encode(contents);
        let cmd = format!(
            "printf '%s' {} | base64 -d > {}",
            quote(&encoded)?,
            quote(path)?
        );
        let result = self.run(&cmd).await?;
        if result.success() {
            Ok(())
        } else {
            Err(ExecError::Transfer {
                path: path.to_string(),
                message: result.stderr.trim().to_string(),
            })
        }
    }

    /// Open an interactive shell
    ///
    /// The default buffers everything sent and runs it as one script when the
    /// shell is finished. Transports with real shell channels override this.
    async fn shell(&self, _pty: bool) -> Result<Box<dyn InteractiveShell + '_>, ExecError> {
        Ok(Box::new(BufferedShell {
            session: self,
            script: String::new(),
        }))
    }

    /// Close the connection. Calling this more than once is a no-op.
    async fn disconnect(&self) -> Result<(), ExecError>;

    /// Whether a live connection is currently held
    fn is_connected(&self) -> bool;

    /// Short name of the transport (e.g. "ssh", "local", "container")
    fn session_type(&self) -> &'static str;
}

/// Handle to an open interactive shell
#[async_trait]
pub trait InteractiveShell: Send {
    /// Send text to the shell's stdin; a trailing newline is added if missing
    async fn send(&mut self, text: &str) -> Result<(), ExecError>;

    /// Close stdin and collect everything the shell produced
    async fn finish(self: Box<Self>) -> Result<CommandResult, ExecError>;
}

/// Shell emulation over plain command execution
struct BufferedShell<'a, S: Session + ?Sized> {
    session: &'a S,
    script: String,
}

#[async_trait]
impl<S: Session + ?Sized> InteractiveShell for BufferedShell<'_, S> {
    async fn send(&mut self, text: &str) -> Result<(), ExecError> {
        self.script.push_str(text);
        if !text.ends_with('\n') {
            self.script.push('\n');
        }
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<CommandResult, ExecError> {
        let cmd = format!("sh -c {}", quote(&self.script)?);
        self.session.run(&cmd).await
    }
}

/// Creates sessions for hosts
///
/// Providers choose the factory when they construct a host, which decides how
/// commands reach it (SSH, container exec, ...).
#[async_trait]
pub trait SessionFactory: Send + Sync + Debug {
    /// Open a connected session
    async fn open(&self, conn: &ConnectionInfo) -> Result<Arc<dyn Session>, ExecError>;

    /// Name of the session type this factory produces
    fn kind(&self) -> &'static str;
}
