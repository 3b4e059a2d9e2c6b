//! Inventory entry type
//!
//! An entry is a flat map describing one checked-out host. A handful of keys
//! are reserved; everything else is preserved as-is.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Host address key
pub const HOSTNAME: &str = "hostname";
/// Backend-side name key
pub const NAME: &str = "name";
/// Provider tag key
pub const PROVIDER: &str = "_broker_provider";
/// Provider instance tag key
pub const PROVIDER_INSTANCE: &str = "_broker_provider_instance";
/// Original checkout arguments key
pub const ARGS: &str = "_broker_args";
/// Logical host type key
pub const HOST_TYPE: &str = "type";

/// Keys with a fixed meaning in every entry
pub const RESERVED_KEYS: [&str; 6] = [HOSTNAME, NAME, PROVIDER, PROVIDER_INSTANCE, ARGS, HOST_TYPE];

/// Merge `overlay` onto `base`
///
/// Overlay values win, except nulls, which are dropped. Nested maps are merged
/// recursively.
#[must_use]
pub fn merge_maps(base: &Map<String, Value>, overlay: &Map<String, Value>) -> Map<String, Value> {
    let mut merged = base.clone();
    for (key, value) in overlay {
        match (merged.get_mut(key), value) {
            (_, Value::Null) => {}
            (Some(Value::Object(existing)), Value::Object(incoming)) => {
                *existing = merge_maps(existing, incoming);
            }
            _ => {
                merged.insert(key.clone(), value.clone());
            }
        }
    }
    merged
}

/// One record in the inventory file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InventoryEntry(Map<String, Value>);

impl InventoryEntry {
    /// Create an empty entry
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Borrow the underlying map
    #[must_use]
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Take the underlying map
    #[must_use]
    pub fn into_map(self) -> Map<String, Value> {
        self.0
    }

    /// Get a value by key
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Get a string value by key
    #[must_use]
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Follow a dotted path (`_broker_args.workflow`) through nested maps
    #[must_use]
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = match current {
                Value::Object(map) => map.get(part)?,
                Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Set a value
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    /// Builder-style `insert`
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    /// Remove a value
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    /// Host address
    #[must_use]
    pub fn hostname(&self) -> Option<&str> {
        self.get_str(HOSTNAME)
    }

    /// Backend-side name
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.get_str(NAME)
    }

    /// Provider that produced this host
    #[must_use]
    pub fn provider(&self) -> Option<&str> {
        self.get_str(PROVIDER)
    }

    /// Provider instance that produced this host
    #[must_use]
    pub fn provider_instance(&self) -> Option<&str> {
        self.get_str(PROVIDER_INSTANCE)
    }

    /// Arguments the host was checked out with
    #[must_use]
    pub fn args(&self) -> Option<&Map<String, Value>> {
        self.0.get(ARGS).and_then(Value::as_object)
    }

    /// Hostname, falling back to name
    #[must_use]
    pub fn identifier(&self) -> Option<&str> {
        self.hostname().or_else(|| self.name())
    }

    /// Whether `id` is this entry's hostname or name
    #[must_use]
    pub fn matches(&self, id: &str) -> bool {
        self.hostname() == Some(id) || self.name() == Some(id)
    }

    /// Whether both entries describe the same host
    #[must_use]
    pub fn same_host(&self, other: &InventoryEntry) -> bool {
        [other.hostname(), other.name()]
            .into_iter()
            .flatten()
            .any(|id| self.matches(id))
    }

    /// This entry with gaps filled from `old`; values already here win
    #[must_use]
    pub fn filled_from(&self, old: &InventoryEntry) -> InventoryEntry {
        InventoryEntry(merge_maps(&old.0, &self.0))
    }
}

impl From<Map<String, Value>> for InventoryEntry {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl From<InventoryEntry> for Value {
    fn from(entry: InventoryEntry) -> Self {
        Value::Object(entry.0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn entry(value: Value) -> InventoryEntry {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_merge_new_wins_old_fills() {
        let old = entry(json!({"hostname": "h", "extra": "keepme", "os": "rhel8"}));
        let new = entry(json!({"hostname": "h", "os": "rhel9"}));

        let merged = new.filled_from(&old);
        assert_eq!(merged.get_str("extra"), Some("keepme"));
        assert_eq!(merged.get_str("os"), Some("rhel9"));
    }

    #[test]
    fn test_merge_null_never_overrides() {
        let base = json!({"workflow": "deploy", "nested": {"a": 1, "b": 2}});
        let overlay = json!({"workflow": null, "nested": {"b": 3}, "count": 2});

        let merged = merge_maps(
            base.as_object().unwrap(),
            overlay.as_object().unwrap(),
        );
        assert_eq!(
            Value::Object(merged),
            json!({"workflow": "deploy", "nested": {"a": 1, "b": 3}, "count": 2})
        );
    }

    #[test]
    fn test_matches_hostname_or_name() {
        let e = entry(json!({"hostname": "host.example.com", "name": "vm-1"}));
        assert!(e.matches("host.example.com"));
        assert!(e.matches("vm-1"));
        assert!(!e.matches("other"));
        assert_eq!(e.identifier(), Some("host.example.com"));
    }

    #[test]
    fn test_get_path() {
        let e = entry(json!({"_broker_args": {"workflow": "deploy", "tags": ["a", "b"]}}));
        assert_eq!(e.get_path("_broker_args.workflow"), Some(&json!("deploy")));
        assert_eq!(e.get_path("_broker_args.tags.1"), Some(&json!("b")));
        assert_eq!(e.get_path("_broker_args.missing"), None);
    }
}
