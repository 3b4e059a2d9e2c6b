//! Running backend command-line tools through a `Session`
//!
//! CLI-wrapping providers hold an `Arc<dyn Session>`: a `LocalSession` in
//! production, a canned session in tests.

use std::sync::Arc;

use hostbroker_core::BrokerError;
use hostbroker_exec::{CommandResult, LocalSession, Session, quote};
use tracing::{debug, instrument};

/// Default command runner: the local shell
#[must_use]
pub fn local_runner() -> Arc<dyn Session> {
    Arc::new(LocalSession::new())
}

/// Quote every argument and join them into one command line
///
/// # Errors
/// Returns `BrokerError::Session` if an argument cannot be quoted
pub fn command_line<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String, BrokerError> {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(&quote(arg.as_ref())?);
    }
    Ok(line)
}

/// Run `cmd`, returning the raw result whatever the exit status
///
/// # Errors
/// Returns `BrokerError::Session` if the command cannot be run at all
#[instrument(skip(runner, cmd))]
pub async fn run(
    runner: &dyn Session,
    provider: &str,
    cmd: &str,
) -> Result<CommandResult, BrokerError> {
    let result = runner.run(cmd).await?;
    debug!(status = result.status, "command finished");
    Ok(result)
}

/// Run `cmd` and return its stdout
///
/// Command lines may carry credentials, so only the program name is echoed in
/// errors.
///
/// # Errors
/// Returns `BrokerError::Provider` if the command exits non-zero
pub async fn run_checked(
    runner: &dyn Session,
    provider: &str,
    cmd: &str,
) -> Result<String, BrokerError> {
    let result = run(runner, provider, cmd).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(BrokerError::provider(
            provider,
            format!(
                "{} failed with status {}: {}",
                cmd.split_whitespace().next().unwrap_or_default(),
                result.status,
                result.stderr.trim()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_line_quotes() {
        let line = command_line("bkr", &["job-results", "J:1", "--hub=https://h/x y"]).unwrap();
        assert_eq!(
            shlex::split(&line).unwrap(),
            vec!["bkr", "job-results", "J:1", "--hub=https://h/x y"]
        );
    }

    #[tokio::test]
    async fn test_run_checked_failure() {
        let runner = local_runner();
        let err = run_checked(runner.as_ref(), "Beaker", "echo nope >&2; exit 3")
            .await
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("status 3"));
        assert!(message.contains("nope"));
    }

    #[tokio::test]
    async fn test_run_checked_success() {
        let runner = local_runner();
        let out = run_checked(runner.as_ref(), "Beaker", "echo hello").await.unwrap();
        assert_eq!(out.trim(), "hello");
    }
}
