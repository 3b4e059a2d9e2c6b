//! Human-friendly timeout parsing
//!
//! `"30s"`, `"5m"`, `"2h"` and `"1d"` are what they look like. A bare integer is
//! milliseconds. Zero means "no timeout"; anything unparseable is an error.

use std::time::Duration;

use serde_json::Value;

use crate::error::BrokerError;

/// Parse a timeout string
///
/// # Errors
/// Returns `BrokerError::User` if `input` is not an integer or an integer
/// followed by one of `s`, `m`, `h`, `d`
pub fn parse_timeout(input: &str) -> Result<Duration, BrokerError> {
    let trimmed = input.trim();
    if let Ok(ms) = trimmed.parse::<u64>() {
        return Ok(Duration::from_millis(ms));
    }

    let invalid = || {
        BrokerError::User(format!(
            "invalid timeout {input:?}: expected an integer (ms) or <n>s, <n>m, <n>h, <n>d"
        ))
    };
    let unit = trimmed.chars().last().ok_or_else(invalid)?;
    let amount = trimmed[..trimmed.len() - unit.len_utf8()]
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid())?;

    let secs = match unit {
        's' => amount,
        'm' => amount.saturating_mul(60),
        'h' => amount.saturating_mul(3_600),
        'd' => amount.saturating_mul(86_400),
        _ => return Err(invalid()),
    };
    Ok(Duration::from_secs(secs))
}

/// Interpret a settings or argument value as a timeout
///
/// Numbers are milliseconds, strings go through `parse_timeout` and null is
/// zero.
///
/// # Errors
/// Returns `BrokerError::User` for a negative or fractional number, an
/// unparseable string, or any other kind of value
pub fn timeout_from_value(value: &Value) -> Result<Duration, BrokerError> {
    match value {
        Value::Null => Ok(Duration::ZERO),
        Value::Number(n) => n
            .as_u64()
            .map(Duration::from_millis)
            .ok_or_else(|| BrokerError::User(format!("invalid timeout {n}"))),
        Value::String(s) => parse_timeout(s),
        other => Err(BrokerError::User(format!("invalid timeout {other}"))),
    }
}

/// `None` for a zero duration, meaning "wait indefinitely"
#[must_use]
pub fn non_zero(duration: Duration) -> Option<Duration> {
    (!duration.is_zero()).then_some(duration)
}
