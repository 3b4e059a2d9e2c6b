//! Settings loading and per-provider settings snapshots
//!
//! Settings live in a TOML file. Provider sections are keyed by the lowercased
//! provider name and may carry named `instances`; a provider instance sees an
//! immutable snapshot built from the section, the selected instance and
//! `HOSTBROKER_<SECTION>__<KEY>` environment overrides.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hostbroker_inventory::InventoryField;
use hostbroker_inventory::fields::default_fields;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::error::BrokerError;
use crate::timeout::timeout_from_value;
use crate::validators::{Validator, validate};

/// Prefix for environment overrides
pub const ENV_PREFIX: &str = "HOSTBROKER_";
/// Environment variable pointing at the settings file
pub const SETTINGS_ENV: &str = "HOSTBROKER_SETTINGS";
/// Environment variable pointing at the broker directory
pub const DIRECTORY_ENV: &str = "HOSTBROKER_DIRECTORY";

/// Settings file name inside the broker directory
pub const SETTINGS_FILE: &str = "settings.toml";
const INVENTORY_FILE: &str = "inventory.yaml";

/// Directory holding settings and inventory
///
/// `$HOSTBROKER_DIRECTORY` if it names a directory, else `~/.hostbroker`.
#[must_use]
pub fn broker_directory() -> PathBuf {
    if let Ok(dir) = std::env::var(DIRECTORY_ENV) {
        let dir = PathBuf::from(dir);
        if dir.is_dir() {
            return dir;
        }
        warn!(path = %dir.display(), "{DIRECTORY_ENV} is not a directory, ignoring");
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".hostbroker")
}

/// Connection defaults for provisioned hosts
#[derive(Clone, Serialize, Deserialize)]
pub struct SshSettings {
    /// Login user
    #[serde(default = "default_username")]
    pub host_username: String,
    /// Login password, used when no key is configured
    #[serde(default = "default_password")]
    pub host_password: Option<String>,
    /// Seconds allowed to establish a connection
    #[serde(default = "default_connection_timeout")]
    pub host_connection_timeout: u64,
    /// SSH port
    #[serde(default = "default_port")]
    pub host_ssh_port: u16,
    /// Private key file
    #[serde(default)]
    pub host_ssh_key_filename: Option<PathBuf>,
}

fn default_username() -> String {
    "root".to_string()
}

#[allow(clippy::unnecessary_wraps)]
fn default_password() -> Option<String> {
    Some("toor".to_string())
}

fn default_connection_timeout() -> u64 {
    60
}

fn default_port() -> u16 {
    22
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            host_username: default_username(),
            host_password: default_password(),
            host_connection_timeout: default_connection_timeout(),
            host_ssh_port: default_port(),
            host_ssh_key_filename: None,
        }
    }
}

impl SshSettings {
    /// Connection timeout as a duration
    #[must_use]
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.host_connection_timeout)
    }
}

impl fmt::Debug for SshSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshSettings")
            .field("host_username", &self.host_username)
            .field("host_password", &self.host_password.as_ref().map(|_| "******"))
            .field("host_connection_timeout", &self.host_connection_timeout)
            .field("host_ssh_port", &self.host_ssh_port)
            .field("host_ssh_key_filename", &self.host_ssh_key_filename)
            .finish()
    }
}

/// Console logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Level filter (error, warn, info, debug, trace)
    #[serde(default = "default_console_level")]
    pub console_level: String,
}

fn default_console_level() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            console_level: default_console_level(),
        }
    }
}

fn default_list_vars() -> String {
    "hostname | name".to_string()
}

/// Top-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Host connection defaults
    #[serde(default)]
    pub ssh: SshSettings,
    /// Logging
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Maximum concurrent workers; one per task when unset
    #[serde(default)]
    pub thread_limit: Option<usize>,
    /// Override for the inventory file location
    #[serde(default)]
    pub inventory_path: Option<PathBuf>,
    /// Columns for inventory listings
    #[serde(default = "default_fields")]
    pub inventory_fields: Vec<InventoryField>,
    /// Field spec used to name hosts in short listings
    #[serde(default = "default_list_vars")]
    pub inventory_list_vars: String,
    /// Named argument presets
    #[serde(default)]
    pub nicks: BTreeMap<String, Map<String, Value>>,
    /// Provider sections, keyed by lowercased provider name
    #[serde(flatten)]
    pub providers: BTreeMap<String, Value>,
    #[serde(skip)]
    env: BTreeMap<String, String>,
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ssh: SshSettings::default(),
            logging: LoggingSettings::default(),
            thread_limit: None,
            inventory_path: None,
            inventory_fields: default_fields(),
            inventory_list_vars: default_list_vars(),
            nicks: BTreeMap::new(),
            providers: BTreeMap::new(),
            env: BTreeMap::new(),
            source: None,
        }
    }
}

impl Settings {
    /// Parse settings from TOML text, without environment overrides
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if the TOML is invalid
    pub fn from_toml_str(content: &str) -> Result<Self, BrokerError> {
        toml::from_str(content).map_err(|e| BrokerError::Configuration(e.to_string()))
    }

    /// Load settings from a file, capturing environment overrides
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if the file cannot be read or parsed
    pub fn load(path: &Path) -> Result<Self, BrokerError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Configuration(format!("cannot read {}: {e}", path.display()))
        })?;
        let mut settings = Self::from_toml_str(&content).map_err(|e| match e {
            BrokerError::Configuration(msg) => {
                BrokerError::Configuration(format!("{}: {msg}", path.display()))
            }
            other => other,
        })?;
        settings.source = Some(path.to_path_buf());
        settings.with_env(std::env::vars())
    }

    /// Find and load settings
    ///
    /// Looks at `explicit`, then `$HOSTBROKER_SETTINGS`, then
    /// `<broker directory>/settings.toml`. Falls back to defaults.
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if a settings file exists but is invalid
    pub fn discover(explicit: Option<&Path>) -> Result<Self, BrokerError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(path) = std::env::var(SETTINGS_ENV) {
            return Self::load(Path::new(&path));
        }

        let path = broker_directory().join(SETTINGS_FILE);
        if path.exists() {
            return Self::load(&path);
        }

        warn!(path = %path.display(), "no settings file found, using defaults");
        Self::default().with_env(std::env::vars())
    }

    /// Apply environment overrides from `vars`
    ///
    /// `HOSTBROKER_SSH__<KEY>` is applied immediately; provider overrides are
    /// kept for snapshots.
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if an SSH override has the wrong type
    pub fn with_env(
        mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, BrokerError> {
        self.env = vars
            .into_iter()
            .filter(|(k, _)| k.starts_with(ENV_PREFIX) && k.contains("__"))
            .collect();

        let ssh_overrides = overrides_for(&self.env, "ssh");
        if !ssh_overrides.is_empty() {
            let mut ssh = serde_json::to_value(&self.ssh)
                .map_err(|e| BrokerError::Configuration(e.to_string()))?;
            if let Value::Object(map) = &mut ssh {
                map.extend(ssh_overrides);
            }
            self.ssh = serde_json::from_value(ssh)
                .map_err(|e| BrokerError::Configuration(format!("ssh override: {e}")))?;
        }
        Ok(self)
    }

    /// File these settings were loaded from
    #[must_use]
    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    /// Inventory file location
    #[must_use]
    pub fn inventory_path(&self) -> PathBuf {
        self.inventory_path
            .clone()
            .unwrap_or_else(|| broker_directory().join(INVENTORY_FILE))
    }

    /// Arguments stored under a nick
    ///
    /// # Errors
    /// Returns `BrokerError::User` for an unknown nick
    pub fn nick(&self, name: &str) -> Result<&Map<String, Value>, BrokerError> {
        self.nicks
            .get(name)
            .ok_or_else(|| BrokerError::User(format!("Unknown nick: {name}")))
    }

    /// Whether a settings section exists for `provider`
    #[must_use]
    pub fn has_section(&self, provider: &str) -> bool {
        self.providers.contains_key(&section_name(provider))
    }

    /// Build the validated settings snapshot for one provider instance
    ///
    /// Instance selection: the named instance, else the one marked
    /// `default = true`, else the only one. Instance keys override section
    /// keys, then environment overrides apply unless the instance sets
    /// `override_envars = true`.
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` listing every violated rule
    pub fn provider_settings(
        &self,
        provider: &str,
        instance: Option<&str>,
        rules: &[Validator],
    ) -> Result<ProviderSettings, BrokerError> {
        let section = section_name(provider);
        let mut values = match self.providers.get(&section) {
            Some(Value::Object(map)) => map.clone(),
            Some(other) => {
                return Err(BrokerError::Configuration(format!(
                    "[{section}] must be a table, got {other}"
                )));
            }
            None => Map::new(),
        };

        let instances = values.remove("instances");
        let (instance, instance_values) = select_instance(provider, instances, instance)?;
        for (key, value) in instance_values {
            if key != "default" {
                values.insert(key, value);
            }
        }

        let override_envars = values
            .get("override_envars")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        if !override_envars {
            values.extend(overrides_for(&self.env, &section));
        }

        let values = validate(rules, values).map_err(|violations| {
            BrokerError::Configuration(format!(
                "{provider}{}: {}",
                instance
                    .as_deref()
                    .map(|i| format!(" instance {i}"))
                    .unwrap_or_default(),
                violations.join("; ")
            ))
        })?;

        debug!(provider, instance = ?instance, "provider settings validated");

        Ok(ProviderSettings {
            provider: provider.to_string(),
            instance,
            values,
        })
    }
}

/// Settings section key for a provider
#[must_use]
pub fn section_name(provider: &str) -> String {
    provider.to_ascii_lowercase()
}

fn overrides_for(env: &BTreeMap<String, String>, section: &str) -> Map<String, Value> {
    let prefix = format!("{ENV_PREFIX}{}__", section.to_ascii_uppercase());
    env.iter()
        .filter_map(|(key, raw)| {
            let key = key.strip_prefix(&prefix)?.to_ascii_lowercase();
            Some((key, parse_env_value(raw)))
        })
        .collect()
}

fn parse_env_value(raw: &str) -> Value {
    match serde_json::from_str::<Value>(raw) {
        Ok(v @ (Value::Bool(_) | Value::Number(_) | Value::Array(_) | Value::Object(_))) => v,
        _ => Value::String(raw.to_string()),
    }
}

type SelectedInstance = (Option<String>, Map<String, Value>);

fn select_instance(
    provider: &str,
    instances: Option<Value>,
    requested: Option<&str>,
) -> Result<SelectedInstance, BrokerError> {
    let instances = match instances {
        None | Some(Value::Null) => {
            if let Some(name) = requested {
                warn!(provider, instance = name, "provider has no instances configured");
            }
            return Ok((requested.map(str::to_string), Map::new()));
        }
        Some(Value::Object(map)) => map,
        Some(other) => {
            return Err(BrokerError::Configuration(format!(
                "{provider} instances must be a table, got {other}"
            )));
        }
    };

    let as_table = |name: &str, value: &Value| -> Result<Map<String, Value>, BrokerError> {
        value.as_object().cloned().ok_or_else(|| {
            BrokerError::Configuration(format!("{provider} instance {name} must be a table"))
        })
    };

    if let Some(name) = requested {
        if let Some(values) = instances.get(name) {
            return Ok((Some(name.to_string()), as_table(name, values)?));
        }
        warn!(provider, instance = name, "instance not found, using the default");
    }

    let default = instances.iter().find(|(_, v)| {
        v.get("default").and_then(Value::as_bool).unwrap_or(false)
    });
    let chosen = match default {
        Some(found) => Some(found),
        None if instances.len() == 1 => instances.iter().next(),
        None => None,
    };

    match chosen {
        Some((name, values)) => Ok((Some(name.clone()), as_table(name, values)?)),
        None => Err(BrokerError::Configuration(format!(
            "{provider} has {} instances and none is marked default",
            instances.len()
        ))),
    }
}

/// Validated, immutable settings for one provider instance
#[derive(Clone)]
pub struct ProviderSettings {
    provider: String,
    instance: Option<String>,
    values: Map<String, Value>,
}

impl ProviderSettings {
    /// Snapshot from explicit values, skipping file and environment lookup
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` listing every violated rule
    pub fn from_values(
        provider: impl Into<String>,
        instance: Option<String>,
        values: Map<String, Value>,
        rules: &[Validator],
    ) -> Result<Self, BrokerError> {
        let provider = provider.into();
        let values = validate(rules, values).map_err(|v| {
            BrokerError::Configuration(format!("{provider}: {}", v.join("; ")))
        })?;
        Ok(Self {
            provider,
            instance,
            values,
        })
    }

    /// Provider these settings belong to
    #[must_use]
    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Selected instance name
    #[must_use]
    pub fn instance(&self) -> Option<&str> {
        self.instance.as_deref()
    }

    /// Raw value
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key).filter(|v| !v.is_null())
    }

    /// String value
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    /// String value that validation guaranteed
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if the key is missing
    pub fn require_str(&self, key: &str) -> Result<&str, BrokerError> {
        self.get_str(key).ok_or_else(|| {
            BrokerError::Configuration(format!("{} setting {key} is required", self.provider))
        })
    }

    /// Boolean value, accepting "true"/"false" strings
    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Unsigned integer value, accepting numeric strings
    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Duration value: integers are seconds, strings use timeout units
    ///
    /// # Errors
    /// Returns `BrokerError::Configuration` if the value is not a valid
    /// duration
    pub fn get_duration(&self, key: &str) -> Result<Option<Duration>, BrokerError> {
        let Some(value) = self.get(key) else {
            return Ok(None);
        };
        let duration = match value {
            Value::Number(n) => n.as_u64().map(Duration::from_secs).ok_or_else(|| {
                BrokerError::User(format!("invalid timeout {n}"))
            }),
            other => timeout_from_value(other),
        };
        duration.map(Some).map_err(|e| {
            BrokerError::Configuration(format!("{} setting {key}: {e}", self.provider))
        })
    }

    /// Every value
    #[must_use]
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }
}

fn is_sensitive(key: &str) -> bool {
    ["password", "token", "secret"]
        .iter()
        .any(|needle| key.contains(needle))
}

impl fmt::Debug for ProviderSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redacted: BTreeMap<&str, String> = self
            .values
            .iter()
            .map(|(k, v)| {
                let shown = if is_sensitive(k) && !v.is_null() {
                    "******".to_string()
                } else {
                    v.to_string()
                };
                (k.as_str(), shown)
            })
            .collect();
        f.debug_struct("ProviderSettings")
            .field("provider", &self.provider)
            .field("instance", &self.instance)
            .field("values", &redacted)
            .finish()
    }
}
