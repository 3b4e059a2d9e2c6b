//! Command execution inside containers through the docker/podman CLI

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::ExecError;
use crate::local::LocalSession;
use crate::result::{CommandResult, ConnectionInfo};
use crate::session::{Session, SessionFactory, quote};

/// Supported container runtimes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntime {
    /// Podman CLI
    #[default]
    Podman,
    /// Docker CLI
    Docker,
}

impl ContainerRuntime {
    /// Executable name
    #[must_use]
    pub fn binary(self) -> &'static str {
        match self {
            ContainerRuntime::Podman => "podman",
            ContainerRuntime::Docker => "docker",
        }
    }

    /// Command prefix, pointing the CLI at a remote engine when `remote` is set
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the remote URL cannot be quoted
    pub fn command_prefix(self, remote: Option<&str>) -> Result<String, ExecError> {
        match remote {
            None => Ok(self.binary().to_string()),
            Some(url) => {
                let flag = match self {
                    ContainerRuntime::Podman => "--url",
                    ContainerRuntime::Docker => "-H",
                };
                Ok(format!("{} {flag} {}", self.binary(), quote(url)?))
            }
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}

impl FromStr for ContainerRuntime {
    type Err = ExecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "podman" => Ok(ContainerRuntime::Podman),
            "docker" => Ok(ContainerRuntime::Docker),
            other => Err(ExecError::ConfigError(format!(
                "unknown container runtime: {other}"
            ))),
        }
    }
}

/// Session that runs commands with `<runtime> exec`
#[derive(Debug, Clone)]
pub struct ContainerSession {
    prefix: String,
    container: String,
    local: LocalSession,
}

impl ContainerSession {
    /// Create a session for `container`
    ///
    /// # Errors
    /// Returns `ExecError::ConfigError` if the remote URL cannot be quoted
    pub fn new(
        runtime: ContainerRuntime,
        remote: Option<&str>,
        container: impl Into<String>,
    ) -> Result<Self, ExecError> {
        Ok(Self {
            prefix: runtime.command_prefix(remote)?,
            container: container.into(),
            local: LocalSession::new(),
        })
    }

    /// Container id or name this session targets
    #[must_use]
    pub fn container(&self) -> &str {
        &self.container
    }

    fn exec_command(&self, cmd: &str) -> Result<String, ExecError> {
        Ok(format!(
            "{} exec {} sh -c {}",
            self.prefix,
            quote(&self.container)?,
            quote(cmd)?
        ))
    }
}

#[async_trait]
impl Session for ContainerSession {
    #[instrument(skip(self), fields(container = %self.container))]
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        debug!(command = %cmd, "executing in container");
        self.local.run(&self.exec_command(cmd)?).await
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.local
            .run_with_timeout(&self.exec_command(cmd)?, timeout)
            .await
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn session_type(&self) -> &'static str {
        "container"
    }
}

/// Opens `ContainerSession`s for one container
#[derive(Debug, Clone)]
pub struct ContainerSessionFactory {
    runtime: ContainerRuntime,
    remote: Option<String>,
    container: String,
}

impl ContainerSessionFactory {
    /// Create a factory for `container`
    pub fn new(
        runtime: ContainerRuntime,
        remote: Option<String>,
        container: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            remote,
            container: container.into(),
        }
    }
}

#[async_trait]
impl SessionFactory for ContainerSessionFactory {
    async fn open(&self, _conn: &ConnectionInfo) -> Result<Arc<dyn Session>, ExecError> {
        Ok(Arc::new(ContainerSession::new(
            self.runtime,
            self.remote.as_deref(),
            self.container.clone(),
        )?))
    }

    fn kind(&self) -> &'static str {
        "container"
    }
}
