//! Inventory listing fields
//!
//! A field spec names what to show for a host in listings:
//!
//! - `hostname | name`: first value that resolves wins
//! - `os_distribution os_distribution_version`: values joined with a space
//! - `$action`: the action key the host was checked out with
//! - anything else is a dotted path into the entry

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entry::InventoryEntry;

/// Placeholder for values that cannot be resolved
pub const UNKNOWN: &str = "Unknown";

/// Special field resolving to the host's checkout action
pub const ACTION_FIELD: &str = "$action";

/// One column in an inventory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryField {
    /// Column label
    pub label: String,
    /// Field spec
    pub field: String,
}

impl InventoryField {
    /// Create a field
    pub fn new(label: impl Into<String>, field: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            field: field.into(),
        }
    }
}

/// Columns shown when nothing is configured
#[must_use]
pub fn default_fields() -> Vec<InventoryField> {
    vec![
        InventoryField::new("Host", "hostname | name"),
        InventoryField::new("Provider", "_broker_provider"),
        InventoryField::new("Action", ACTION_FIELD),
        InventoryField::new("OS", "os_distribution os_distribution_version"),
    ]
}

/// Action keys registered per provider, used to resolve `$action`
pub type ProviderActions = HashMap<String, Vec<String>>;

/// Resolve every field for `entry`, in order
#[must_use]
pub fn resolve_fields(
    fields: &[InventoryField],
    entry: &InventoryEntry,
    actions: &ProviderActions,
) -> Vec<(String, String)> {
    fields
        .iter()
        .map(|f| (f.label.clone(), resolve_field(&f.field, entry, actions)))
        .collect()
}

/// Resolve a single field spec
#[must_use]
pub fn resolve_field(field: &str, entry: &InventoryEntry, actions: &ProviderActions) -> String {
    if field.contains('|') {
        return field
            .split('|')
            .map(|f| resolve_field(f.trim(), entry, actions))
            .find(|v| !v.is_empty() && v != UNKNOWN)
            .unwrap_or_else(|| UNKNOWN.to_string());
    }

    if field.split_whitespace().nth(1).is_some() {
        return field
            .split_whitespace()
            .map(|f| resolve_field(f, entry, actions))
            .collect::<Vec<_>>()
            .join(" ");
    }

    if field == ACTION_FIELD {
        return host_action(entry, actions);
    }

    match entry.get_path(field) {
        None | Some(Value::Null) => UNKNOWN.to_string(),
        Some(Value::String(s)) if s.is_empty() => UNKNOWN.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn host_action(entry: &InventoryEntry, actions: &ProviderActions) -> String {
    let (Some(provider), Some(args)) = (entry.provider(), entry.args()) else {
        return UNKNOWN.to_string();
    };
    actions
        .get(provider)
        .into_iter()
        .flatten()
        .find_map(|key| match args.get(key) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        })
        .unwrap_or_else(|| UNKNOWN.to_string())
}
