//! Result and connection types for sessions

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ExecError;

/// Result of a command execution
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    /// Exit status code (0 for success)
    pub status: i32,
    /// stdout output
    pub stdout: String,
    /// stderr output
    pub stderr: String,
    /// Time taken to execute
    pub duration: Duration,
}

impl CommandResult {
    /// Check if command succeeded (exit code 0)
    #[must_use]
    pub fn success(&self) -> bool {
        self.status == 0
    }

    /// Combine stdout and stderr
    #[must_use]
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }

    /// Turn a non-zero exit status into `ExecError::CommandFailed`
    ///
    /// # Errors
    /// Returns `ExecError::CommandFailed` when the status is not 0
    pub fn into_checked(self) -> Result<Self, ExecError> {
        if self.success() {
            Ok(self)
        } else {
            Err(ExecError::CommandFailed {
                status: self.status,
                stderr: self.stderr,
            })
        }
    }
}

impl std::fmt::Display for CommandResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "stdout:\n{}\nstderr:\n{}\nstatus: {}",
            self.stdout, self.stderr, self.status
        )
    }
}

/// Everything needed to reach a host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionInfo {
    /// Host address
    pub host: String,
    /// Port (default 22)
    #[serde(default = "default_port")]
    pub port: u16,
    /// Username
    pub user: String,
    /// Optional password, used when no key is configured
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    /// Optional SSH key path
    pub key_filename: Option<PathBuf>,
    /// Time allowed to establish the connection
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: Duration,
}

fn default_port() -> u16 {
    22
}

fn default_connection_timeout() -> Duration {
    Duration::from_secs(60)
}

impl ConnectionInfo {
    /// Create new connection info
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            user: user.into(),
            password: None,
            key_filename: None,
            connection_timeout: default_connection_timeout(),
        }
    }

    /// Set SSH key path
    #[must_use]
    pub fn with_key_filename(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_filename = Some(path.into());
        self
    }

    /// Set password
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set custom port
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set connection timeout
    #[must_use]
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_checked() {
        let ok = CommandResult {
            status: 0,
            stdout: "fine".to_string(),
            ..Default::default()
        };
        assert!(ok.into_checked().is_ok());

        let bad = CommandResult {
            status: 2,
            stderr: "no such file".to_string(),
            ..Default::default()
        };
        match bad.into_checked() {
            Err(ExecError::CommandFailed { status, stderr }) => {
                assert_eq!(status, 2);
                assert_eq!(stderr, "no such file");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_password_not_serialized() {
        let info = ConnectionInfo::new("host.example.com", "root").with_password("toor");
        let json = serde_json::to_string(&info).unwrap();
        assert!(!json.contains("toor"));
    }
}
