//! Error types for hostbroker-exec

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a host through a session
#[derive(Error, Debug, Clone)]
pub enum ExecError {
    /// Failed to connect to remote host
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication failed
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// An established connection stopped accepting requests
    #[error("connection lost: {0}")]
    ConnectionLost(String),

    /// Command execution failed
    #[error("command execution failed: {status} - {stderr}")]
    CommandFailed {
        /// Exit status code
        status: i32,
        /// Stderr output
        stderr: String,
    },

    /// Command timed out
    #[error("command timed out after {timeout:?}")]
    Timeout {
        /// Timeout duration that was exceeded
        timeout: Duration,
    },

    /// File transfer failed
    #[error("transfer of {path} failed: {message}")]
    Transfer {
        /// Remote path involved in the transfer
        path: String,
        /// What went wrong
        message: String,
    },

    /// SSH key error
    #[error("SSH key error: {0}")]
    SshKeyError(String),

    /// Process spawn error
    #[error("failed to spawn process: {0}")]
    SpawnError(String),

    /// I/O error during execution
    #[error("I/O error: {0}")]
    IoError(String),

    /// Connection not established
    #[error("not connected")]
    NotConnected,

    /// Operation not offered by this session type
    #[error("{operation} is not supported by {session} sessions")]
    Unsupported {
        /// Session type name
        session: &'static str,
        /// Requested operation
        operation: &'static str,
    },

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    ConfigError(String),
}

impl ExecError {
    /// Whether the cached connection should be discarded and re-established
    #[must_use]
    pub fn is_stale(&self) -> bool {
        matches!(self, ExecError::ConnectionLost(_) | ExecError::NotConnected)
    }
}
