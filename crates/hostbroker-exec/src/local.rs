//! Local command execution using `tokio::process`
//!
//! Used to drive CLI-based backends (`bkr`, `docker`, `podman`) from the
//! broker machine itself.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, error, instrument};

use crate::error::ExecError;
use crate::result::CommandResult;
use crate::session::Session;

/// Session running commands on the local machine
#[derive(Debug, Clone, Default)]
pub struct LocalSession {
    /// Working directory for spawned commands
    cwd: Option<std::path::PathBuf>,
}

impl LocalSession {
    /// Create a new local session
    #[must_use]
    pub fn new() -> Self {
        Self { cwd: None }
    }

    /// Run commands from the given directory
    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<std::path::PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[instrument(skip(self), level = "debug")]
    async fn execute(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        debug!(command = %cmd, "executing local command");

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(cmd)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let child = command
            .spawn()
            .map_err(|e| ExecError::SpawnError(e.to_string()))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| ExecError::IoError(e.to_string()))?;

        let duration = start.elapsed();
        let status = output.status.code().unwrap_or(-1);
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            debug!(command = %cmd, duration = ?duration, "command completed");
        } else {
            error!(
                command = %cmd,
                status = status,
                stderr = %stderr,
                "command failed"
            );
        }

        Ok(CommandResult {
            status,
            stdout,
            stderr,
            duration,
        })
    }
}

#[async_trait]
impl Session for LocalSession {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.execute(cmd).await
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout_duration: Duration,
    ) -> Result<CommandResult, ExecError> {
        let start = Instant::now();

        match timeout(timeout_duration, self.execute(cmd)).await {
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

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, ExecError> {
        tokio::fs::read(path).await.map_err(|e| ExecError::Transfer {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> Result<(), ExecError> {
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| ExecError::Transfer {
                path: path.to_string(),
                message: e.to_string(),
            })
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn session_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_success() {
        let session = LocalSession::new();
        let result = session.run("echo hello").await.unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_failure() {
        let session = LocalSession::new();
        let result = session.run("exit 42").await.unwrap();

        assert!(!result.success());
        assert_eq!(result.status, 42);
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let session = LocalSession::new();
        let result = session
            .run_with_timeout("sleep 5", Duration::from_millis(100))
            .await;

        assert!(matches!(result, Err(ExecError::Timeout { .. })));
    }

    #[tokio::test]
    async fn test_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let session = LocalSession::new().with_cwd(dir.path());
        session.run("echo marker > here.txt").await.unwrap();
        assert!(dir.path().join("here.txt").exists());
    }

    #[tokio::test]
    async fn test_disconnect_is_noop() {
        let session = LocalSession::new();
        session.disconnect().await.unwrap();
        session.disconnect().await.unwrap();
        assert!(session.is_connected());
    }
}
