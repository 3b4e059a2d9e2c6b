//! Request envelopes
//!
//! A `CheckoutRequest` is what callers build. Resolving it against settings
//! and the registry yields an `ActionRequest`, which is what providers see.

use hostbroker_inventory::merge_maps;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::error::BrokerError;
use crate::settings::Settings;
use crate::timeout::{non_zero, timeout_from_value};

fn default_count() -> usize {
    1
}

/// Caller-facing request for hosts or an execute action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckoutRequest {
    /// Named preset whose arguments sit under the caller's
    #[serde(default)]
    pub nick: Option<String>,
    /// Caller arguments, including exactly one action key
    #[serde(default)]
    pub args: Map<String, Value>,
    /// Number of hosts to check out
    #[serde(default = "default_count")]
    pub count: usize,
    /// Connect each host before returning it
    #[serde(default)]
    pub connect: bool,
}

impl Default for CheckoutRequest {
    fn default() -> Self {
        Self {
            nick: None,
            args: Map::new(),
            count: default_count(),
            connect: false,
        }
    }
}

impl CheckoutRequest {
    /// Empty request for one host
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a nick
    #[must_use]
    pub fn with_nick(mut self, nick: impl Into<String>) -> Self {
        self.nick = Some(nick.into());
        self
    }

    /// Set one argument
    #[must_use]
    pub fn with_arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }

    /// Merge a set of arguments over the current ones
    #[must_use]
    pub fn with_args(mut self, args: Map<String, Value>) -> Self {
        self.args.extend(args);
        self
    }

    /// Number of hosts
    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = count;
        self
    }

    /// Connect hosts before returning them
    #[must_use]
    pub fn with_connect(mut self, connect: bool) -> Self {
        self.connect = connect;
        self
    }

    /// Final argument map: nick arguments with caller arguments on top
    ///
    /// Null caller values never replace a nick value.
    ///
    /// # Errors
    /// Returns `BrokerError::User` for an unknown nick
    pub fn resolve_args(&self, settings: &Settings) -> Result<Map<String, Value>, BrokerError> {
        let base = match &self.nick {
            Some(nick) => settings.nick(nick)?.clone(),
            None => Map::new(),
        };
        Ok(merge_maps(&base, &self.args))
    }
}

/// Resolved request handed to a provider method
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    /// Action key that selected the method
    pub action: String,
    /// Value supplied for the action key
    pub payload: Value,
    /// Every resolved argument, action key included
    pub args: Map<String, Value>,
    /// Checked by polling loops between iterations
    #[serde(skip)]
    pub cancel: CancellationToken,
}

impl ActionRequest {
    /// Build a request
    pub fn new(action: impl Into<String>, args: Map<String, Value>) -> Self {
        let action = action.into();
        let payload = args.get(&action).cloned().unwrap_or(Value::Null);
        Self {
            action,
            payload,
            args,
            cancel: CancellationToken::new(),
        }
    }

    /// Attach a cancellation token
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Payload as a string
    #[must_use]
    pub fn payload_str(&self) -> Option<&str> {
        self.payload.as_str()
    }

    /// Argument by key, nulls treated as absent
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.args.get(key).filter(|v| !v.is_null())
    }

    /// String argument
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// Timeout argument in the usual units, if present and non-zero
    ///
    /// # Errors
    /// Returns `BrokerError::User` if the value is not a valid timeout
    pub fn timeout(&self, key: &str) -> Result<Option<std::time::Duration>, BrokerError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let timeout = timeout_from_value(value)
            .map_err(|e| BrokerError::User(format!("argument {key}: {e}")))?;
        Ok(non_zero(timeout))
    }

    /// Whether the request has been cancelled
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn settings() -> Settings {
        Settings::from_toml_str(
            r#"
[nicks.rhel9]
workflow = "deploy-rhel"
rhel_version = "9"
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_caller_args_win_over_nick() {
        let request = CheckoutRequest::new()
            .with_nick("rhel9")
            .with_arg("rhel_version", "9.4")
            .with_arg("workflow", Value::Null);

        let args = request.resolve_args(&settings()).unwrap();
        assert_eq!(args["rhel_version"], json!("9.4"));
        assert_eq!(args["workflow"], json!("deploy-rhel"));
    }

    #[test]
    fn test_unknown_nick() {
        let request = CheckoutRequest::new().with_nick("fedora");
        let err = request.resolve_args(&settings()).unwrap_err();
        assert!(matches!(err, BrokerError::User(_)));
    }

    #[test]
    fn test_request_defaults_from_json() {
        let request: CheckoutRequest =
            serde_json::from_value(json!({"args": {"workflow": "x"}})).unwrap();
        assert_eq!(request.count, 1);
        assert!(!request.connect);
    }

    #[test]
    fn test_action_request_payload() {
        let args = json!({"workflow": "deploy-rhel", "timeout": "5m"});
        let request = ActionRequest::new("workflow", args.as_object().unwrap().clone());
        assert_eq!(request.payload_str(), Some("deploy-rhel"));
        assert_eq!(
            request.timeout("timeout").unwrap(),
            Some(std::time::Duration::from_secs(300))
        );
        assert_eq!(request.timeout("missing").unwrap(), None);

        let args = json!({"workflow": "deploy-rhel", "timeout": "90min"});
        let request = ActionRequest::new("workflow", args.as_object().unwrap().clone());
        let err = request.timeout("timeout").unwrap_err();
        assert_eq!(err.exit_code(), 11);
        assert!(err.to_string().contains("90min"));
    }
}
