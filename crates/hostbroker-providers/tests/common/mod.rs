#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use hostbroker_core::{ProviderDescriptor, ProviderSettings, SshSettings};
use hostbroker_exec::{CommandResult, ExecError, Session};
use serde_json::{Map, Value};

/// Session answering commands from a script
///
/// Each rule pairs a substring with queued responses. The first rule whose
/// substring appears in the command answers it; its last response repeats
/// once the queue runs dry. Unmatched commands fail with status 127.
#[derive(Debug, Default)]
pub struct CannedSession {
    rules: Mutex<Vec<(String, VecDeque<CommandResult>)>>,
    commands: Mutex<Vec<String>>,
}

impl CannedSession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, needle: &str, stdout: &str) -> Self {
        self.on_result(needle, ok(stdout))
    }

    pub fn on_result(self, needle: &str, result: CommandResult) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|(n, _)| n == needle) {
                Some((_, queue)) => queue.push_back(result),
                None => rules.push((needle.to_string(), VecDeque::from([result]))),
            }
        }
        self
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    /// Whether any command contained every needle
    pub fn ran(&self, needles: &[&str]) -> bool {
        self.commands()
            .iter()
            .any(|c| needles.iter().all(|n| c.contains(n)))
    }
}

pub fn ok(stdout: &str) -> CommandResult {
    result(0, stdout, "")
}

pub fn result(status: i32, stdout: &str, stderr: &str) -> CommandResult {
    CommandResult {
        status,
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        duration: Duration::ZERO,
    }
}

#[async_trait]
impl Session for CannedSession {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.commands.lock().unwrap().push(cmd.to_string());
        let mut rules = self.rules.lock().unwrap();
        let Some((_, queue)) = rules.iter_mut().find(|(n, _)| cmd.contains(n.as_str())) else {
            return Ok(result(127, "", &format!("unexpected command: {cmd}")));
        };
        let response = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        Ok(response.unwrap_or_else(|| ok("")))
    }

    async fn run_with_timeout(
        &self,
        cmd: &str,
        _timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.run(cmd).await
    }

    async fn disconnect(&self) -> Result<(), ExecError> {
        Ok(())
    }

    fn is_connected(&self) -> bool {
        true
    }

    fn session_type(&self) -> &'static str {
        "canned"
    }
}

pub fn runner(session: CannedSession) -> (Arc<CannedSession>, Arc<dyn Session>) {
    let session = Arc::new(session);
    let runner: Arc<dyn Session> = session.clone();
    (session, runner)
}

/// Validated settings for `descriptor`
pub fn settings(descriptor: &ProviderDescriptor, values: Value) -> ProviderSettings {
    let values: Map<String, Value> = values.as_object().cloned().unwrap_or_default();
    ProviderSettings::from_values(descriptor.name(), None, values, descriptor.validators()).unwrap()
}

pub fn ssh() -> SshSettings {
    SshSettings::default()
}
