//! Worker pools for multi-host checkout
//!
//! Each task provisions one host and reports its inventory record. Workers
//! never touch the inventory file; the broker persists what they return.
//!
//! - `TaskPool`: tokio tasks in this process, bounded by a semaphore
//! - `ProcessPool`: one child `hostbroker worker` process per task, fed a JSON
//!   `WorkerTask` on stdin and answering with a JSON `WorkerOutcome` on stdout

use std::fmt::Debug;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use hostbroker_inventory::InventoryEntry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, instrument};

use crate::broker::BrokerCore;
use crate::error::BrokerError;
use crate::registry::ProviderRegistry;
use crate::settings::Settings;

/// Hidden CLI subcommand that serves one task
pub const WORKER_SUBCOMMAND: &str = "worker";

/// One unit of work sent to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerTask {
    /// Fully resolved checkout arguments
    pub args: Map<String, Value>,
    /// Settings file the worker should load
    pub settings_path: Option<PathBuf>,
}

impl WorkerTask {
    /// Task for `args` using the same settings as `core`
    #[must_use]
    pub fn new(args: Map<String, Value>, settings: &Settings) -> Self {
        Self {
            args,
            settings_path: settings.source().map(PathBuf::from),
        }
    }
}

/// What a worker reports back
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// Host provisioned
    Provisioned {
        /// Inventory record of the new host
        record: InventoryEntry,
    },
    /// Provisioning failed
    Failed {
        /// Error message
        message: String,
        /// Exit code of the underlying error
        exit_code: i32,
    },
}

impl From<Result<InventoryEntry, BrokerError>> for WorkerOutcome {
    fn from(result: Result<InventoryEntry, BrokerError>) -> Self {
        match result {
            Ok(record) => WorkerOutcome::Provisioned { record },
            Err(e) => WorkerOutcome::Failed {
                message: e.to_string(),
                exit_code: e.exit_code(),
            },
        }
    }
}

impl WorkerOutcome {
    /// Back into a result
    ///
    /// # Errors
    /// Returns `BrokerError::Worker` carrying the worker's message
    pub fn into_result(self) -> Result<InventoryEntry, BrokerError> {
        match self {
            WorkerOutcome::Provisioned { record } => Ok(record),
            WorkerOutcome::Failed { message, .. } => Err(BrokerError::Worker(message)),
        }
    }
}

/// Runs checkout tasks concurrently
#[async_trait]
pub trait WorkerPool: Send + Sync + Debug {
    /// Run every task and wait for all of them
    ///
    /// Results come back in task order.
    async fn run(
        &self,
        core: Arc<BrokerCore>,
        tasks: Vec<WorkerTask>,
    ) -> Vec<Result<InventoryEntry, BrokerError>>;
}

fn worker_limit(configured: Option<usize>, settings: &Settings, tasks: usize) -> usize {
    configured
        .or(settings.thread_limit)
        .unwrap_or(tasks)
        .clamp(1, tasks.max(1))
}

/// In-process pool of tokio tasks
#[derive(Debug, Clone, Default)]
pub struct TaskPool {
    limit: Option<usize>,
}

impl TaskPool {
    /// Pool bounded by `thread_limit`, or one task per host
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Explicit concurrency limit
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
impl WorkerPool for TaskPool {
    #[instrument(skip_all, fields(tasks = tasks.len()))]
    async fn run(
        &self,
        core: Arc<BrokerCore>,
        tasks: Vec<WorkerTask>,
    ) -> Vec<Result<InventoryEntry, BrokerError>> {
        let limit = worker_limit(self.limit, core.settings(), tasks.len());
        let semaphore = Arc::new(Semaphore::new(limit));
        debug!(limit, "starting task pool");

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let core = core.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| BrokerError::Worker(e.to_string()))?;
                let host = core.provision(task.args).await?;
                Ok(host.to_record())
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "checkout task panicked");
                    Err(BrokerError::Worker(e.to_string()))
                }
            });
        }
        results
    }
}

/// Pool of child processes
#[derive(Debug, Clone)]
pub struct ProcessPool {
    program: PathBuf,
    limit: Option<usize>,
}

impl ProcessPool {
    /// Pool that runs `<program> worker`
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            limit: None,
        }
    }

    /// Pool that re-runs the current executable
    ///
    /// # Errors
    /// Returns `BrokerError::Worker` if the executable path is unavailable
    pub fn current_exe() -> Result<Self, BrokerError> {
        std::env::current_exe()
            .map(Self::new)
            .map_err(|e| BrokerError::Worker(format!("cannot locate executable: {e}")))
    }

    /// Explicit concurrency limit
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    async fn spawn_worker(&self, task: &WorkerTask) -> Result<InventoryEntry, BrokerError> {
        let payload =
            serde_json::to_vec(task).map_err(|e| BrokerError::Worker(e.to_string()))?;

        let mut child = Command::new(&self.program)
            .arg(WORKER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BrokerError::Worker(format!("cannot start {}: {e}", self.program.display()))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .map_err(|e| BrokerError::Worker(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BrokerError::Worker(e.to_string()))?;
        debug!(status = %output.status, "worker exited");

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().rev().find(|l| !l.trim().is_empty()).ok_or_else(|| {
            BrokerError::Worker(format!("worker exited with {} and no result", output.status))
        })?;
        let outcome: WorkerOutcome = serde_json::from_str(line)
            .map_err(|e| BrokerError::Worker(format!("unreadable worker result: {e}")))?;
        outcome.into_result()
    }
}

#[async_trait]
impl WorkerPool for ProcessPool {
    #[instrument(skip_all, fields(tasks = tasks.len(), program = %self.program.display()))]
    async fn run(
        &self,
        core: Arc<BrokerCore>,
        tasks: Vec<WorkerTask>,
    ) -> Vec<Result<InventoryEntry, BrokerError>> {
        let limit = worker_limit(self.limit, core.settings(), tasks.len());
        let semaphore = Arc::new(Semaphore::new(limit));
        info!(limit, "starting worker processes");

        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let pool = self.clone();
            let semaphore = semaphore.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .map_err(|e| BrokerError::Worker(e.to_string()))?;
                pool.spawn_worker(&task).await
            }));
        }

        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            results.push(
                handle
                    .await
                    .unwrap_or_else(|e| Err(BrokerError::Worker(e.to_string()))),
            );
        }
        results
    }
}

/// Serve one worker task: read it from `input`, provision, answer on `output`
///
/// Provisioning failures are reported through `output`; only I/O and decoding
/// problems are returned as errors.
///
/// # Errors
/// Returns `BrokerError::Worker` if the task cannot be read or the answer
/// cannot be written
pub async fn serve_worker<R, W>(
    registry: ProviderRegistry,
    mut input: R,
    mut output: W,
) -> Result<(), BrokerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut raw = String::new();
    input
        .read_to_string(&mut raw)
        .await
        .map_err(|e| BrokerError::Worker(e.to_string()))?;
    let task: WorkerTask = serde_json::from_str(&raw)
        .map_err(|e| BrokerError::Worker(format!("invalid worker task: {e}")))?;

    let result = match Settings::discover(task.settings_path.as_deref()) {
        Ok(settings) => {
            let core = BrokerCore::new(settings, registry);
            core.provision(task.args).await.map(|host| host.to_record())
        }
        Err(e) => Err(e),
    };
    if let Err(e) = &result {
        error!(error = %e, "worker checkout failed");
    }

    let mut line = serde_json::to_vec(&WorkerOutcome::from(result))
        .map_err(|e| BrokerError::Worker(e.to_string()))?;
    line.push(b'\n');
    output
        .write_all(&line)
        .await
        .map_err(|e| BrokerError::Worker(e.to_string()))?;
    output
        .flush()
        .await
        .map_err(|e| BrokerError::Worker(e.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_outcome_wire_format() {
        let outcome = WorkerOutcome::from(Err(BrokerError::provider("Beaker", "job J:1 failed")));
        let wire = serde_json::to_value(&outcome).unwrap();
        assert_eq!(wire["status"], json!("failed"));
        assert_eq!(wire["exit_code"], json!(7));

        let record: InventoryEntry =
            serde_json::from_value(json!({"hostname": "h", "_broker_provider": "Beaker"})).unwrap();
        let wire = serde_json::to_string(&WorkerOutcome::Provisioned { record: record.clone() })
            .unwrap();
        let back: WorkerOutcome = serde_json::from_str(&wire).unwrap();
        assert_eq!(back.into_result().unwrap(), record);
    }

    #[test]
    fn test_worker_limit() {
        let mut settings = Settings::default();
        assert_eq!(worker_limit(None, &settings, 7), 7);
        settings.thread_limit = Some(3);
        assert_eq!(worker_limit(None, &settings, 7), 3);
        assert_eq!(worker_limit(Some(10), &settings, 7), 7);
        assert_eq!(worker_limit(Some(0), &settings, 0), 1);
    }

    #[tokio::test]
    async fn test_serve_worker_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let settings_path = dir.path().join("settings.toml");
        std::fs::write(&settings_path, "").unwrap();

        let task = WorkerTask {
            args: json!({"nothing": "registered"}).as_object().unwrap().clone(),
            settings_path: Some(settings_path),
        };
        let input = serde_json::to_vec(&task).unwrap();
        let mut output = Vec::new();

        let registry = ProviderRegistry::new(Vec::new()).unwrap();
        serve_worker(registry, input.as_slice(), &mut output)
            .await
            .unwrap();

        let outcome: WorkerOutcome = serde_json::from_slice(&output).unwrap();
        assert!(matches!(outcome, WorkerOutcome::Failed { exit_code: 11, .. }));
    }
}
