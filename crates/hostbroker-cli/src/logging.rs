//! Console logging setup

use clap::ValueEnum;
use eyre::eyre;
use tracing_subscriber::EnvFilter;

/// Log line format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Filter from `--log-level`, then `RUST_LOG`, then the settings level
fn filter(cli_level: Option<&str>, settings_level: &str) -> eyre::Result<EnvFilter> {
    if let Some(level) = cli_level {
        return Ok(EnvFilter::try_new(level)?);
    }
    match EnvFilter::try_from_default_env() {
        Ok(filter) => Ok(filter),
        Err(_) => Ok(EnvFilter::try_new(settings_level)?),
    }
}

/// Install the global subscriber, writing to stderr
///
/// Stdout is kept for command output and the worker protocol.
///
/// # Errors
/// Returns an error for an invalid level directive or if a subscriber is
/// already installed
pub fn init(cli_level: Option<&str>, settings_level: &str, format: LogFormat) -> eyre::Result<()> {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter(cli_level, settings_level)?)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    }
    .map_err(|e| eyre!("cannot initialize logging: {e}"))
}
